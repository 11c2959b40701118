use sha2::{Digest, Sha256};

/// Hex sha256 over `parts` joined with a unit separator.
///
/// This is the one hash in the system: it signs preflight invocations (argv
/// plus run inputs) and prompt payloads for dispatch descriptors. Hashing
/// the parts with an explicit separator keeps `["ab", "c"]` distinct from
/// `["a", "bc"]`.
pub fn signature_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Cap an issue list for report readability, noting how many were elided.
pub fn cap_issues(issues: &mut Vec<String>, cap: usize) {
    if cap == 0 || issues.len() <= cap {
        return;
    }
    let elided = issues.len() - cap;
    issues.truncate(cap);
    issues.push(format!("... {elided} more elided"));
}
