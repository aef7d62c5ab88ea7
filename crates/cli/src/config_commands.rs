use std::path::Path;

use courier_config::{CourierConfig, Severity, validate};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Print diagnostics for `config`. Returns the number of errors.
pub fn check(config: &CourierConfig, source: Option<&Path>) -> usize {
    match source {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("No config file found; checking defaults.\n"),
    }

    let result = validate(config);
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !result.diagnostics.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
    errors
}
