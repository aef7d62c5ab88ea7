/// Expand `${NAME}` and `${NAME:-fallback}` references in raw config text.
///
/// References to unset variables without a fallback are kept verbatim so the
/// validator can point at them.
pub fn substitute_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference, copy the remainder as-is.
            out.push_str(&rest[start..]);
            return out;
        };

        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };

        match (lookup(name), fallback) {
            (Some(value), _) if !name.is_empty() => out.push_str(&value),
            (_, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(reference);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
