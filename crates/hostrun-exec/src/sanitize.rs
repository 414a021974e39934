//! Diagnostic cleanup for captured client output

/// Client chatter stripped from captured command output.
const DIAGNOSTIC_LINES: &[&str] = &[
    "Warning: no access to tty",
    "Thus no job control in this shell",
];

/// Remove known non-semantic client diagnostics from `raw`.
///
/// Splits on line endings (bare or carriage-return prefixed), drops any
/// line carrying one of the known diagnostics, and concatenates the
/// survivors **without separators**. Multi-line output therefore
/// collapses into a single line. That is long-standing observable
/// behavior callers depend on; do not restore the separators.
#[must_use]
pub fn clean_output(raw: &str) -> String {
    raw.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !DIAGNOSTIC_LINES.iter().any(|needle| line.contains(needle)))
        .collect()
}
