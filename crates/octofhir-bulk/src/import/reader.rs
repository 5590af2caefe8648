use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::Result;

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Single forward pass over the lines of an NDJSON source.
///
/// Lines are produced lazily together with their 1-based line number. The
/// reader cannot be rewound; reopen the source for another pass.
pub struct NdjsonReader {
    lines: Lines<BufReader<BoxedRead>>,
    line_number: usize,
    source: String,
}

impl NdjsonReader {
    /// Open a file, or stdin when `path` is `None` or `-`.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p != Path::new("-") => {
                let file = File::open(p).await?;
                Ok(Self::from_reader(file, p.display().to_string()))
            }
            _ => Ok(Self::from_reader(tokio::io::stdin(), "<stdin>")),
        }
    }

    pub fn from_reader<R>(reader: R, source: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let boxed: BoxedRead = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            line_number: 0,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next line and its number, `None` at end of input.
    pub async fn next_line(&mut self) -> Result<Option<(usize, String)>> {
        match self.lines.next_line().await? {
            Some(line) => {
                self.line_number += 1;
                Ok(Some((self.line_number, line)))
            }
            None => Ok(None),
        }
    }
}
