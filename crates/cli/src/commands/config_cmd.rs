//! `cadence config`: configuration management commands.

use cadence_config::CadenceConfig;
use std::path::Path;

use super::load_config;

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Chain:      {}", config.backends.fallback_chain.join(" → "));
    println!("   Threshold:  {}", config.decision.acceptance_threshold);
    println!(
        "   Delays:     {}..{}ms ({:?})",
        config.scheduler.min_delay_ms, config.scheduler.max_delay_ms, config.scheduler.jitter
    );
    println!(
        "   Safety:     {} failures / {}ms",
        config.safety.failure_ceiling, config.safety.failure_window_ms
    );
    println!("   Sessions:   {}", config.sessions.len());
    Ok(())
}

/// Legal but suspicious settings.
fn warnings(config: &CadenceConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    for id in &config.backends.fallback_chain {
        let is_rule_table = config.backends.rule_tables.iter().any(|t| &t.id == id);
        if !is_rule_table {
            warnings.push(format!(
                "Backend '{id}' is not a rule table; it must be registered by the embedding application"
            ));
        }
    }
    if config.backends.fallback_chain.len() == 1 {
        warnings.push("Fallback chain has a single backend; any outage degrades every session".into());
    }
    if config.decision.acceptance_threshold == 0.0 {
        warnings.push("Acceptance threshold 0.0 accepts every candidate".into());
    }
    if config.safety.failure_ceiling == 0 {
        warnings.push("Failure ceiling 0 stops a session on its first failed dispatch".into());
    }
    warnings
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = CadenceConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

pub async fn defaults() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", CadenceConfig::default_toml());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_warnings() {
        assert!(warnings(&CadenceConfig::default()).is_empty());
    }

    #[test]
    fn unknown_chain_entry_is_flagged() {
        let mut config = CadenceConfig::default();
        config.backends.fallback_chain.push("remote".into());
        let warnings = warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("remote"));
    }
}
