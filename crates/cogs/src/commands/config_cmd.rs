//! Config subcommand handlers.

use std::io::{self, BufRead, Write};

use cogs_config::{load_config, save_config, split_keys, store_keys};
use cogs_core::{KeySet, PubSubError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "<redacted>";

// ── Helpers ─────────────────────────────────────────────────────────

fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}

/// Prompt for a line of input, returning `default` on an empty answer.
fn prompt_line(label: &str, default: &str) -> Result<String, CliError> {
    eprint!("{label} [{default}]: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map_err(prompt_err)?;
    let answer = line.trim();
    Ok(if answer.is_empty() { default.to_owned() } else { answer.to_owned() })
}

/// Keys from `--key`/`COGS_KEYS`, else from a hidden prompt. Validated
/// before anything is stored.
fn collect_keys(global: &GlobalOpts) -> Result<Vec<String>, CliError> {
    let keys = if global.keys.is_empty() {
        let raw =
            rpassword::prompt_password("Project keys (comma-separated): ").map_err(prompt_err)?;
        split_keys(&raw)
    } else {
        global.keys.clone()
    };

    let parsed = KeySet::parse(&keys).map_err(PubSubError::from)?;
    eprintln!(
        "   identity {} with permissions {}",
        parsed.identity(),
        parsed.permissions()
    );
    Ok(keys)
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init { plaintext } => {
            let mut cfg = load_config()?;
            let profile_name = cfg.profile_name(global.profile.as_deref());
            eprintln!("cogs configuration for profile '{profile_name}'");
            eprintln!("   Config path: {}\n", cogs_config::config_path().display());

            let current_url = cfg
                .profiles
                .get(&profile_name)
                .and_then(|p| p.url.clone())
                .unwrap_or_else(|| cfg.defaults.url.clone());
            let url = match &global.url {
                Some(url) => url.clone(),
                None => prompt_line("Pub/Sub URL", &current_url)?,
            };
            let keys = collect_keys(global)?;

            let profile = cfg.profiles.entry(profile_name.clone()).or_default();
            profile.url = (url != cfg.defaults.url).then_some(url);
            cogs_config::profile_to_options(profile, &cfg.defaults)?;

            if plaintext {
                profile.keys = keys;
            } else {
                store_keys(&profile_name, &keys)?;
                profile.keys.clear();
                eprintln!("   ✓ keys stored in system keyring");
            }
            if cfg.default_profile.is_none() {
                cfg.default_profile = Some(profile_name.clone());
            }

            let path = save_config(&cfg)?;
            eprintln!("   ✓ profile '{profile_name}' saved to {}", path.display());
            Ok(())
        }

        ConfigCommand::Show => {
            let mut cfg = load_config()?;
            for profile in cfg.profiles.values_mut() {
                for key in &mut profile.keys {
                    REDACTED.clone_into(key);
                }
            }
            let rendered = toml::to_string_pretty(&cfg).map_err(|e| CliError::Validation {
                field: "config".into(),
                reason: format!("failed to serialize config: {e}"),
            })?;
            output::print_output(rendered.trim_end());
            Ok(())
        }

        ConfigCommand::SetKeys => {
            let cfg = load_config()?;
            let profile_name = cfg.profile_name(global.profile.as_deref());
            let keys = collect_keys(global)?;
            store_keys(&profile_name, &keys)?;
            eprintln!("   ✓ keys for profile '{profile_name}' stored in system keyring");
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&cogs_config::config_path().display().to_string());
            Ok(())
        }
    }
}
