use super::ControlError;
use bitmesh_common::control;

/// One status line of a reply, with its data block if it had one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,

    /// `' '` for the final line, `'-'` for a mid line, `'+'` for a data line
    pub separator: char,

    pub text: String,

    /// Lines of the data block following a `'+'` line, dot-unescaped
    pub data: Vec<String>,
}

/// A complete logical reply (or event) from the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status code of the first line
    pub fn code(&self) -> u16 {
        self.lines.first().map(|line| line.code).unwrap_or_default()
    }

    /// Text of the first line
    pub fn text(&self) -> &str {
        self.lines.first().map(|line| line.text.as_str()).unwrap_or_default()
    }

    pub fn is_event(&self) -> bool {
        self.code() / 100 == control::EVENT_CODE / 100
    }

    /// The `650 OK` trailer some daemons send on its own
    pub fn is_bare_event_ok(&self) -> bool {
        self.lines.len() == 1 && self.code() == control::EVENT_CODE && self.text() == "OK"
    }

    /// Sort a command reply into success, rejection or garbage
    pub fn into_result(self) -> Result<Reply, ControlError> {
        for line in &self.lines {
            if control::OK_CODES.contains(&line.code) {
                continue;
            }
            return match line.code / 100 {
                4 | 5 => Err(ControlError::Request {
                    code: line.code,
                    message: line.text.clone(),
                }),
                _ => Err(ControlError::Protocol(format!(
                    "unexpected reply code {}: {}",
                    line.code, line.text
                ))),
            };
        }
        Ok(self)
    }
}

/// Accumulates raw lines into logical replies
#[derive(Debug, Default)]
pub struct ReplyParser {
    lines: Vec<ReplyLine>,
    data_block: Option<ReplyLine>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns a reply once its final line has arrived.
    pub fn feed(&mut self, raw: &str) -> Result<Option<Reply>, ControlError> {
        let line = raw.trim_end_matches(&['\r', '\n'][..]);

        if let Some(mut block) = self.data_block.take() {
            if line == "." {
                self.lines.push(block);
            } else {
                let unescaped = match line.strip_prefix('.') {
                    Some(rest) if rest.starts_with('.') => rest,
                    _ => line,
                };
                block.data.push(unescaped.to_string());
                self.data_block = Some(block);
            }
            return Ok(None);
        }

        let (code, separator, text) = split_status_line(line)?;
        let reply_line = ReplyLine {
            code,
            separator,
            text: text.to_string(),
            data: Vec::new(),
        };

        match separator {
            '+' => {
                self.data_block = Some(reply_line);
                Ok(None)
            }
            '-' => {
                self.lines.push(reply_line);
                Ok(None)
            }
            _ => {
                self.lines.push(reply_line);
                Ok(Some(Reply {
                    lines: std::mem::take(&mut self.lines),
                }))
            }
        }
    }

    /// Whether a partial reply is buffered
    pub fn is_mid_reply(&self) -> bool {
        !self.lines.is_empty() || self.data_block.is_some()
    }
}

fn split_status_line(line: &str) -> Result<(u16, char, &str), ControlError> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(ControlError::Protocol(format!("malformed line: {:?}", line)));
    }

    let separator = bytes[3] as char;
    if !matches!(separator, ' ' | '-' | '+') {
        return Err(ControlError::Protocol(format!(
            "bad separator {:?} in line: {:?}",
            separator, line
        )));
    }

    let code = bytes[..3]
        .iter()
        .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));
    Ok((code, separator, &line[4..]))
}
