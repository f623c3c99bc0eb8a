//! JSON mode
//!
//! A byte-level pushdown recognizer for JSON prefixes. In JSON mode every
//! candidate token is checked against it so the reply is always a prefix of
//! a valid JSON object, and generation stops once the object is closed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Num {
    Minus,
    Zero,
    Int,
    Dot,
    Frac,
    Exp,
    ExpSign,
    ExpInt,
}

impl Num {
    fn is_terminal(self) -> bool {
        matches!(self, Num::Zero | Num::Int | Num::Frac | Num::ExpInt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    /// Hex digits still expected after `\u`
    Unicode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the top-level object
    Start,
    Value,
    FirstKeyOrEnd,
    Key,
    Colon,
    FirstValueOrEnd,
    CommaOrEnd,
    Str { key: bool, escape: Escape },
    Number(Num),
    Literal { word: &'static [u8], pos: usize },
    /// Top-level object closed; only whitespace may follow
    Done,
}

#[derive(Debug, Clone)]
pub struct JsonPrefixValidator {
    stack: Vec<Container>,
    state: State,
}

impl Default for JsonPrefixValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r' | b'\t')
}

impl JsonPrefixValidator {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            state: State::Start,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Whether appending `bytes` keeps the text a valid prefix
    pub fn accepts(&self, bytes: &[u8]) -> bool {
        let mut trial = self.clone();
        bytes.iter().all(|&b| trial.step(b))
    }

    /// Append `bytes`. On rejection the validator is left unchanged.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        let mut next = self.clone();
        if bytes.iter().all(|&b| next.step(b)) {
            *self = next;
            true
        } else {
            false
        }
    }

    fn value_done(&mut self) {
        self.state = if self.stack.is_empty() {
            State::Done
        } else {
            State::CommaOrEnd
        };
    }

    fn close(&mut self, kind: Container) -> bool {
        if self.stack.pop() != Some(kind) {
            return false;
        }
        self.value_done();
        true
    }

    fn start_value(&mut self, b: u8) -> bool {
        self.state = match b {
            b'{' => {
                self.stack.push(Container::Object);
                State::FirstKeyOrEnd
            }
            b'[' => {
                self.stack.push(Container::Array);
                State::FirstValueOrEnd
            }
            b'"' => State::Str {
                key: false,
                escape: Escape::None,
            },
            b'-' => State::Number(Num::Minus),
            b'0' => State::Number(Num::Zero),
            b'1'..=b'9' => State::Number(Num::Int),
            b't' => State::Literal { word: b"true", pos: 1 },
            b'f' => State::Literal { word: b"false", pos: 1 },
            b'n' => State::Literal { word: b"null", pos: 1 },
            _ => return false,
        };
        true
    }

    fn step(&mut self, b: u8) -> bool {
        match self.state {
            State::Start => {
                if is_ws(b) {
                    return true;
                }
                if b != b'{' {
                    return false;
                }
                self.stack.push(Container::Object);
                self.state = State::FirstKeyOrEnd;
                true
            }
            State::Value => is_ws(b) || self.start_value(b),
            State::FirstKeyOrEnd => match b {
                _ if is_ws(b) => true,
                b'"' => {
                    self.state = State::Str {
                        key: true,
                        escape: Escape::None,
                    };
                    true
                }
                b'}' => self.close(Container::Object),
                _ => false,
            },
            State::Key => match b {
                _ if is_ws(b) => true,
                b'"' => {
                    self.state = State::Str {
                        key: true,
                        escape: Escape::None,
                    };
                    true
                }
                _ => false,
            },
            State::Colon => match b {
                _ if is_ws(b) => true,
                b':' => {
                    self.state = State::Value;
                    true
                }
                _ => false,
            },
            State::FirstValueOrEnd => match b {
                _ if is_ws(b) => true,
                b']' => self.close(Container::Array),
                _ => self.start_value(b),
            },
            State::CommaOrEnd => match b {
                _ if is_ws(b) => true,
                b',' => {
                    self.state = match self.stack.last() {
                        Some(Container::Object) => State::Key,
                        _ => State::Value,
                    };
                    true
                }
                b'}' => self.close(Container::Object),
                b']' => self.close(Container::Array),
                _ => false,
            },
            State::Str { key, escape } => self.step_string(key, escape, b),
            State::Number(num) => self.step_number(num, b),
            State::Literal { word, pos } => {
                if word.get(pos) != Some(&b) {
                    return false;
                }
                if pos + 1 == word.len() {
                    self.value_done();
                } else {
                    self.state = State::Literal { word, pos: pos + 1 };
                }
                true
            }
            State::Done => is_ws(b),
        }
    }

    fn step_string(&mut self, key: bool, escape: Escape, b: u8) -> bool {
        let escape = match escape {
            Escape::None => match b {
                b'"' => {
                    if key {
                        self.state = State::Colon;
                    } else {
                        self.value_done();
                    }
                    return true;
                }
                b'\\' => Escape::Backslash,
                0x00..=0x1f => return false,
                _ => Escape::None,
            },
            Escape::Backslash => match b {
                b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => Escape::None,
                b'u' => Escape::Unicode(4),
                _ => return false,
            },
            Escape::Unicode(remaining) => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
                if remaining == 1 {
                    Escape::None
                } else {
                    Escape::Unicode(remaining - 1)
                }
            }
        };
        self.state = State::Str { key, escape };
        true
    }

    fn step_number(&mut self, num: Num, b: u8) -> bool {
        let next = match (num, b) {
            (Num::Minus, b'0') => Some(Num::Zero),
            (Num::Minus, b'1'..=b'9') => Some(Num::Int),
            (Num::Int, b'0'..=b'9') => Some(Num::Int),
            (Num::Zero | Num::Int, b'.') => Some(Num::Dot),
            (Num::Dot | Num::Frac, b'0'..=b'9') => Some(Num::Frac),
            (Num::Zero | Num::Int | Num::Frac, b'e' | b'E') => Some(Num::Exp),
            (Num::Exp, b'+' | b'-') => Some(Num::ExpSign),
            (Num::Exp | Num::ExpSign | Num::ExpInt, b'0'..=b'9') => Some(Num::ExpInt),
            _ => None,
        };
        match next {
            Some(next) => {
                self.state = State::Number(next);
                true
            }
            // The number ended; the byte belongs to what follows it
            None if num.is_terminal() => {
                self.value_done();
                self.step(b)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepts_all(text: &str) -> JsonPrefixValidator {
        let mut v = JsonPrefixValidator::new();
        assert!(v.feed(text.as_bytes()), "rejected {text:?}");
        v
    }

    #[test]
    fn test_complete_objects() {
        for text in [
            "{}",
            r#"{"a": 1}"#,
            r#" {"a": [1, -2.5e+3, true, null, {"b": "c\n\u00e9"}], "d": false} "#,
            r#"{"nested": {"deep": [[], [0]]}}"#,
        ] {
            assert!(accepts_all(text).is_complete(), "{text} should be complete");
        }
    }

    #[test]
    fn test_prefixes_are_accepted_but_incomplete() {
        let v = accepts_all(r#"{"a": [1, 2"#);
        assert!(!v.is_complete());
        assert!(v.accepts(b"]}"));
        assert!(!v.accepts(b"}"));
    }

    #[test]
    fn test_rejections() {
        let v = JsonPrefixValidator::new();
        assert!(!v.accepts(b"[1]"), "top level must be an object");
        assert!(!v.accepts(b"hello"));
        assert!(!v.accepts(b"{a:1}"));
        assert!(!v.accepts(b"{\"a\" 1}"));
        assert!(!v.accepts(b"{\"a\": 01}"));
        assert!(!v.accepts(b"{\"a\": tru}x"));
        assert!(!v.accepts(b"{\"a\": \"\\x\"}"));
        assert!(!v.accepts(b"{\"a\": 1,}"));
    }

    #[test]
    fn test_nothing_after_completion() {
        let v = accepts_all("{}");
        assert!(v.accepts(b"\n "));
        assert!(!v.accepts(b"{}"));
    }

    #[test]
    fn test_feed_rejection_leaves_state() {
        let mut v = accepts_all("{\"a\":");
        assert!(!v.feed(b"}"));
        assert!(v.feed(b"1}"));
        assert!(v.is_complete());
    }
}
