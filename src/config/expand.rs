/// Replace every `${name}` in `input` with `lookup(name)`, or an empty string
/// when the lookup has no value.
///
/// Single pass: substituted values are not scanned again. An unterminated
/// `${` is copied to the output verbatim together with the rest of the input.
pub fn expand_placeholders<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&lookup(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "user.dir" => Some("/work".to_string()),
            "HOME" => Some("/home/qa".to_string()),
            "loop" => Some("${loop}".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_no_placeholder_is_identity() {
        for s in ["", "plain", "http://127.0.0.1:4723", "$notbrace", "{x}"] {
            assert_eq!(expand_placeholders(s, lookup), s);
        }
    }

    #[test]
    fn test_known_and_unknown_names() {
        assert_eq!(
            expand_placeholders("${user.dir}/apps/${missing}app.apk", lookup),
            "/work/apps/app.apk"
        );
        assert_eq!(expand_placeholders("${HOME}${HOME}", lookup), "/home/qa/home/qa");
    }

    #[test]
    fn test_unterminated_left_verbatim() {
        assert_eq!(expand_placeholders("a/${user.dir", lookup), "a/${user.dir");
        assert_eq!(
            expand_placeholders("${HOME}/x/${oops", lookup),
            "/home/qa/x/${oops"
        );
    }

    #[test]
    fn test_single_pass() {
        assert_eq!(expand_placeholders("${loop}", lookup), "${loop}");
    }
}
