//! Cursor-based tokenizer for one line of agent output.
//!
//! A [`ParsedCommand`] splits a line on a delimiter once, then hands out typed tokens from
//! left to right. Scalar getters (`next_str`, `next_int`, `next_float`) consume exactly one
//! token; array getters (`next_str_arr`, ...) consume everything that is left.
//!
//! ```
//! use match_runtime::parser::ParsedCommand;
//!
//! let mut cmd = ParsedCommand::new("move 3 1.5 a b", " ");
//! assert_eq!(cmd.next_str().unwrap(), "move");
//! assert_eq!(cmd.next_int().unwrap(), 3);
//! assert_eq!(cmd.next_float().unwrap(), 1.5);
//! assert_eq!(cmd.next_str_arr().unwrap(), vec!["a", "b"]);
//! assert!(cmd.next_str().is_err());
//! ```

use crate::error::ParseError;

/// One line of text split into tokens, with a read cursor.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    line: String,
    tokens: Vec<String>,
    index: usize,
}

impl ParsedCommand {
    /// Split `line` on `delimiter`. A single trailing empty token (from a terminal delimiter) is
    /// dropped.
    pub fn new(line: &str, delimiter: &str) -> ParsedCommand {
        let mut tokens: Vec<String> = if delimiter.is_empty() {
            vec![line.to_string()]
        } else {
            line.split(delimiter).map(str::to_string).collect()
        };
        if tokens.last().is_some_and(String::is_empty) {
            tokens.pop();
        }
        ParsedCommand {
            line: line.to_string(),
            tokens,
            index: 0,
        }
    }

    /// The original, unsplit line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Number of tokens not consumed yet.
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.index
    }

    /// Consume the next token as is.
    pub fn next_str(&mut self) -> Result<String, ParseError> {
        let token = self.tokens.get(self.index).ok_or(ParseError::Exhausted)?;
        self.index += 1;
        Ok(token.clone())
    }

    /// Consume one token as an integer.
    ///
    /// A token that is not an integer is still consumed, and reported as
    /// [`ParseError::NotANumber`] so the caller can decide what to do with it.
    pub fn next_int(&mut self) -> Result<i64, ParseError> {
        let token = self.next_str()?;
        parse_int(&token)
    }

    /// Consume one token as a float. Non-numeric tokens give `f64::NAN`.
    pub fn next_float(&mut self) -> Result<f64, ParseError> {
        let token = self.next_str()?;
        Ok(parse_float(&token))
    }

    /// Consume every remaining token.
    pub fn next_str_arr(&mut self) -> Result<Vec<String>, ParseError> {
        if self.remaining() == 0 {
            return Err(ParseError::Exhausted);
        }
        let rest = self.tokens[self.index..].to_vec();
        self.index = self.tokens.len();
        Ok(rest)
    }

    /// Consume every remaining token as integers. Fails on the first non-integer token.
    pub fn next_int_arr(&mut self) -> Result<Vec<i64>, ParseError> {
        self.next_str_arr()?.iter().map(|t| parse_int(t)).collect()
    }

    /// Consume every remaining token as floats, non-numeric ones becoming `f64::NAN`.
    pub fn next_float_arr(&mut self) -> Result<Vec<f64>, ParseError> {
        Ok(self
            .next_str_arr()?
            .iter()
            .map(|t| parse_float(t))
            .collect())
    }
}

fn parse_int(token: &str) -> Result<i64, ParseError> {
    token
        .trim()
        .parse()
        .map_err(|_| ParseError::NotANumber(token.to_string()))
}

fn parse_float(token: &str) -> f64 {
    token.trim().parse().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reproduces_tokens_then_exhausts() {
        let tokens = ["alpha", "b", "3", "", "x y"];
        let line = tokens.join(",");
        let mut cmd = ParsedCommand::new(&line, ",");
        for t in tokens {
            assert_eq!(cmd.next_str().unwrap(), t);
        }
        assert_eq!(cmd.next_str(), Err(ParseError::Exhausted));
    }

    #[test]
    fn trailing_delimiter_is_not_a_token() {
        let mut cmd = ParsedCommand::new("a,b,", ",");
        assert_eq!(cmd.remaining(), 2);
        assert_eq!(cmd.next_str_arr().unwrap(), vec!["a", "b"]);
        assert_eq!(cmd.next_str_arr(), Err(ParseError::Exhausted));
    }

    #[test]
    fn only_one_trailing_empty_token_is_dropped() {
        let cmd = ParsedCommand::new("a,,", ",");
        assert_eq!(cmd.remaining(), 2);
    }

    #[test]
    fn numbers() {
        let mut cmd = ParsedCommand::new("12 -4 0.25 abc", " ");
        assert_eq!(cmd.next_int().unwrap(), 12);
        assert_eq!(cmd.next_int().unwrap(), -4);
        assert_eq!(cmd.next_float().unwrap(), 0.25);
        assert!(cmd.next_float().unwrap().is_nan());
        assert_eq!(cmd.next_int(), Err(ParseError::Exhausted));
    }

    #[test]
    fn non_numeric_int_is_reported_and_consumed() {
        let mut cmd = ParsedCommand::new("x 1", " ");
        assert_eq!(cmd.next_int(), Err(ParseError::NotANumber("x".into())));
        assert_eq!(cmd.next_int().unwrap(), 1);
    }

    #[test]
    fn arrays_take_the_remainder() {
        let mut cmd = ParsedCommand::new("pos 1 2 3", " ");
        cmd.next_str().unwrap();
        assert_eq!(cmd.next_int_arr().unwrap(), vec![1, 2, 3]);
        assert_eq!(cmd.remaining(), 0);

        let mut cmd = ParsedCommand::new("1.5 nope", " ");
        let floats = cmd.next_float_arr().unwrap();
        assert_eq!(floats[0], 1.5);
        assert!(floats[1].is_nan());
    }
}
