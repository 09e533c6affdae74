/// Replace every occurrence of each non-empty secret in `text` with `<Filtered>`.
pub fn scrub(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_owned();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, "<Filtered>");
    }
    out
}
