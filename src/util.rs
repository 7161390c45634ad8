#[macro_export]
macro_rules! args {
    ($($element:expr),*) => {{
        #[allow(unused_mut)]
        let mut vs = Vec::new();
        $(vs.push($element.to_string());)*
        vs
    }};
    ($($element:expr,)*) => {{
        $crate::args![$($element),*]
    }};
}

/// Quotes `arg` for a POSIX shell if it contains anything beyond plain
/// word characters.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '{' | '}')
        });
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_macro() {
        let args = args!["new", 10, true];
        assert_eq!(args, vec!["new", "10", "true"]);
    }

    #[test]
    fn quote_plain_args_untouched() {
        assert_eq!(shell_quote("./run.sh"), "./run.sh");
        assert_eq!(shell_quote("run_id=10"), "run_id=10");
    }

    #[test]
    fn quote_args_with_spaces_and_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
