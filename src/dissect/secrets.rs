//! Picking the TLS key-log lines that belong to a capture.
//!
//! A key log (`SSLKEYLOGFILE` format) accumulates secrets for every session
//! the browser ever opened. Only lines naming one of the capture's
//! ClientHello randoms are injected.

/// `AA:bb:01` → `aabb01`
pub fn normalize_hex(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Randoms from `tshark -T fields -e tls.handshake.random` output. Several
/// values on one line are comma separated.
pub fn parse_randoms(output: &str) -> Vec<String> {
    let mut randoms: Vec<String> = output
        .split(|c| c == '\n' || c == ',')
        .map(normalize_hex)
        .filter(|r| !r.is_empty())
        .collect();
    randoms.sort();
    randoms.dedup();
    randoms
}

/// Key-log lines mentioning any of `randoms`, in file order.
pub fn matching_lines<'a>(keylog: &'a str, randoms: &[String]) -> Vec<&'a str> {
    if randoms.is_empty() {
        return Vec::new();
    }
    keylog
        .lines()
        .filter(|line| {
            let line = normalize_hex(line);
            randoms.iter().any(|r| line.contains(r.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYLOG: &str = "\
# SSL/TLS secrets log file
CLIENT_HANDSHAKE_TRAFFIC_SECRET AABBCCDD 0102
SERVER_HANDSHAKE_TRAFFIC_SECRET aabbccdd 0304
CLIENT_RANDOM 11223344 ffff
";

    #[test]
    fn randoms_are_normalized_and_deduplicated() {
        let out = "aa:bb:cc:dd\n11:22:33:44,AA:BB:CC:DD\n\n";
        assert_eq!(parse_randoms(out), ["11223344", "aabbccdd"]);
    }

    #[test]
    fn only_matching_lines_are_kept() {
        let randoms = vec!["aabbccdd".to_owned()];
        let lines = matching_lines(KEYLOG, &randoms);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("CLIENT_HANDSHAKE"));
        assert!(matching_lines(KEYLOG, &[]).is_empty());
        assert!(matching_lines(KEYLOG, &["deadbeef".to_owned()]).is_empty());
    }
}
