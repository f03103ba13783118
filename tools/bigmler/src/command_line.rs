//! Single-line text form of an argument vector.
//!
//! Tokens made only of shell-safe characters are written bare; anything else
//! is double-quoted with backslash escapes. Line breaks are escaped so every
//! command occupies exactly one log line. `split` also accepts single quotes
//! and bare backslash escapes so hand-edited shell lines still load.

use crate::errors::BigmlerError;

pub fn join(argv: &[String]) -> String {
    argv.iter()
        .map(|token| quote(token))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn quote(token: &str) -> String {
    if !token.is_empty() && token.chars().all(is_safe_char) {
        return token.to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for ch in token.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '`' => out.push_str("\\`"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn is_safe_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(ch, '-' | '_' | '.' | '/' | '=' | ':' | ',' | '@' | '%' | '+')
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Bare,
    Single,
    Double,
}

pub fn split(line: &str) -> Result<Vec<String>, BigmlerError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut mode = Mode::Bare;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match mode {
            Mode::Bare => match ch {
                ' ' | '\t' => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '\'' => {
                    mode = Mode::Single;
                    in_token = true;
                }
                '"' => {
                    mode = Mode::Double;
                    in_token = true;
                }
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| {
                        BigmlerError::CorruptLog(format!("dangling escape in `{line}`"))
                    })?;
                    current.push(escaped);
                    in_token = true;
                }
                other => {
                    current.push(other);
                    in_token = true;
                }
            },
            Mode::Single => match ch {
                '\'' => mode = Mode::Bare,
                other => current.push(other),
            },
            Mode::Double => match ch {
                '"' => mode = Mode::Bare,
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| {
                        BigmlerError::CorruptLog(format!("unterminated quote in `{line}`"))
                    })?;
                    match escaped {
                        '\\' | '"' | '$' | '`' => current.push(escaped),
                        'n' => current.push('\n'),
                        'r' => current.push('\r'),
                        't' => current.push('\t'),
                        other => {
                            current.push('\\');
                            current.push(other);
                        }
                    }
                }
                other => current.push(other),
            },
        }
    }

    if mode != Mode::Bare {
        return Err(BigmlerError::CorruptLog(format!(
            "unterminated quote in `{line}`"
        )));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn safe_tokens_stay_bare() {
        let line = join(&argv(&["bigmler", "--train", "data/iris.csv", "--objective=species"]));
        assert_eq!(line, "bigmler --train data/iris.csv --objective=species");
    }

    #[test]
    fn spaces_quotes_and_newlines_are_escaped_on_one_line() {
        let tokens = argv(&["--name", "my \"best\" model", "it's", "a\nb", "", "café"]);
        let line = join(&tokens);
        assert!(!line.contains('\n'));
        assert_eq!(split(&line).expect("split"), tokens);
    }

    #[test]
    fn hand_written_shell_quoting_is_accepted() {
        let tokens = split(r#"bigmler --name 'my model' --tag a\ b --description "x \"y\"""#)
            .expect("split");
        assert_eq!(
            tokens,
            argv(&["bigmler", "--name", "my model", "--tag", "a b", "--description", "x \"y\""])
        );
    }

    #[test]
    fn unterminated_quote_is_corrupt() {
        let err = split("bigmler --name 'oops").expect_err("must fail");
        assert!(matches!(err, BigmlerError::CorruptLog(_)));
        assert!(split("bigmler \\").is_err());
    }

    proptest! {
        #[test]
        fn join_then_split_round_trips(tokens in proptest::collection::vec(any::<String>(), 0..8)) {
            let line = join(&tokens);
            prop_assert!(!line.contains('\n'));
            prop_assert!(!line.contains('\r'));
            prop_assert_eq!(split(&line).expect("split"), tokens);
        }
    }
}
