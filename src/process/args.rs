//! Splitting of the `cmd_args` string into an argument vector.
//!
//! Arguments are separated by whitespace. A field that starts with a double quote runs to the
//! matching closing quote and may contain whitespace; `""` inside it stands for one literal
//! quote. Quotes anywhere else are rejected.

use thiserror::Error;

/// Errors that can arise splitting an argument string.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArgsError {
    /// A quoted field has no closing quote.
    #[error("unterminated quoted argument")]
    UnterminatedQuote,

    /// A quote appears inside an unquoted field.
    #[error("bare \" in non-quoted argument")]
    BareQuote,

    /// A closing quote is followed by something other than whitespace.
    #[error("extraneous or missing \" in quoted argument")]
    TextAfterQuote,
}

/// Splits `input` into arguments.
pub fn split_args(input: &str) -> Result<Vec<String>, ArgsError> {
    let mut args = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(ArgsError::UnterminatedQuote),
                    Some('"') => {
                        if chars.next_if_eq(&'"').is_some() {
                            arg.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(c) => arg.push(c),
                }
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return Err(ArgsError::TextAfterQuote);
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '"' {
                    return Err(ArgsError::BareQuote);
                }
                arg.push(c);
            }
        }
        args.push(arg);
    }

    Ok(args)
}
