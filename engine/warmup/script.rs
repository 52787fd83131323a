use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::Path;

pub const USER_KEYWORD: &str = "USER";
pub const END_BLOCK: &str = "}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    BeginBlock { user: String, database: String },
    Query(String),
    EndBlock,
    Malformed { line_number: usize, line: String },
}

/// Lazily parsed warmup script.
///
/// ```text
/// USER <user> <database>
/// <query>
/// ...
/// }
/// ```
///
/// Blank lines are skipped everywhere. Inside a block every line other than a
/// lone `}` is a query, even one that starts with `USER`.
pub struct WarmupScript<R> {
    lines: Lines<R>,
    line_number: usize,
    in_block: bool,
}

impl WarmupScript<BufReader<File>> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> WarmupScript<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            in_block: false,
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }

    fn classify(&mut self, line: String) -> ScriptEvent {
        if self.in_block {
            if line == END_BLOCK {
                self.in_block = false;
                return ScriptEvent::EndBlock;
            }
            return ScriptEvent::Query(line);
        }

        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(keyword), Some(user), Some(database)) if keyword.starts_with(USER_KEYWORD) => {
                self.in_block = true;
                ScriptEvent::BeginBlock {
                    user: user.to_string(),
                    database: database.to_string(),
                }
            }
            _ => ScriptEvent::Malformed {
                line_number: self.line_number,
                line,
            },
        }
    }
}

impl<R: BufRead> Iterator for WarmupScript<R> {
    type Item = io::Result<ScriptEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }
            return Some(Ok(self.classify(line)));
        }
    }
}
