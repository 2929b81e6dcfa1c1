use std::error;
use std::fmt;
use std::io;

/// Errors surfaced by the index core.
#[derive(Debug)]
pub enum Error {
	/// Invalid structure, unknown options, or an inconsistent subset.
	Config(String),
	/// Endpoint I/O failure after retries were exhausted.
	Storage { path: String, source: io::Error },
	/// Output schema incompatible with the stored schema.
	Schema(String),
	/// Chunk capacity exceeded at the maximum depth.
	Overflow { depth: u64 },
	/// Chunk or hierarchy block bytes do not decode cleanly.
	CorruptChunk { path: String, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
			Error::Storage { path, source } => write!(f, "storage failure at {}: {}", path, source),
			Error::Schema(msg) => write!(f, "incompatible schema: {}", msg),
			Error::Overflow { depth } => write!(f, "chunk capacity exceeded at depth {}", depth),
			Error::CorruptChunk { path, detail } => write!(f, "corrupt data at {}: {}", path, detail),
		}
	}
}

impl error::Error for Error {
	fn source(&self) -> Option<&(dyn error::Error + 'static)> {
		match self {
			Error::Storage { source, .. } => Some(source),
			_ => None,
		}
	}
}
