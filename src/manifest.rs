use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileStatus {
	Outstanding,
	Added,
	Omitted,
	Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
	pub path: String,
	pub status: FileStatus,
	pub num_points: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl FileInfo {
	pub fn new(path: &str) -> FileInfo {
		FileInfo {
			path: path.to_string(),
			status: FileStatus::Outstanding,
			num_points: 0,
			message: None,
		}
	}
}

/// Per-source-file ingest ledger. A failing file is recorded here and
/// the build moves on, which is also what makes a partial build
/// resumable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
	pub files: Vec<FileInfo>,
}

impl Manifest {
	pub fn new(paths: &[String]) -> Manifest {
		Manifest {
			files: paths.iter().map(|p| FileInfo::new(p)).collect(),
		}
	}

	pub fn update(
		&mut self,
		path: &str,
		status: FileStatus,
		num_points: u64,
		message: Option<String>,
	) {
		match self.files.iter_mut().find(|f| f.path == path) {
			Some(file) => {
				file.status = status;
				file.num_points = num_points;
				file.message = message;
			}
			None => self.files.push(FileInfo {
				path: path.to_string(),
				status,
				num_points,
				message,
			}),
		}
	}

	pub fn total_points(&self) -> u64 {
		self.files
			.iter()
			.filter(|f| f.status == FileStatus::Added)
			.map(|f| f.num_points)
			.sum()
	}

	pub fn has_errors(&self) -> bool {
		self.files.iter().any(|f| f.status == FileStatus::Error)
	}

	pub fn append(&mut self, other: &Manifest) {
		self.files.extend(other.files.iter().cloned());
	}
}
