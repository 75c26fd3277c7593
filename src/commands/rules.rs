use console::style;
use std::fs;
use trench_core::errors::TrenchResult;
use trench_core::rules::Rules;

/// Parses a rules JSON document and reports what it found. Catches a
/// malformed document before any fixpoint run ever starts (§7 `ConfigError`
/// policy: JSON parsing failures are raised once, up front).
pub fn handle(path: &str) -> TrenchResult<()> {
    let text = fs::read_to_string(path)?;
    let rules = Rules::from_json(&text)?;

    println!("{} {}", style("Loaded").green().bold(), style(path).underlined());
    println!("  {} rule(s)", rules.definitions().len());
    for rule in rules.definitions() {
        let partial = if rule.partial_sink_labels.is_empty() {
            String::new()
        } else {
            format!(" (partial labels: {})", rule.partial_sink_labels.keys().cloned().collect::<Vec<_>>().join(", "))
        };
        println!(
            "  [{}] {}: {} -> {}{}",
            rule.code,
            rule.name,
            rule.source_kinds.join("|"),
            rule.sink_kinds.join("|"),
            partial
        );
    }
    Ok(())
}
