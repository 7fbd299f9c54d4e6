//! CLI-side configuration: `GlobalOpts` overrides layered on top of the
//! profile resolution in `cogs-config`.

use secrecy::SecretString;

use cogs_config::{Config, Profile};
use cogs_core::ConnectionOptions;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Everything needed to open a session.
pub struct Resolved {
    pub profile: String,
    pub keys: Vec<SecretString>,
    pub options: ConnectionOptions,
}

/// Resolve keys and connection options from the config file, the active
/// profile and CLI flags, in increasing order of precedence.
pub fn resolve(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = cogs_config::load_config()?;
    resolve_with(&cfg, global)
}

pub fn resolve_with(cfg: &Config, global: &GlobalOpts) -> Result<Resolved, CliError> {
    let profile_name = cfg.profile_name(global.profile.as_deref());
    let fallback = Profile::default();

    let profile = match cfg.profiles.get(&profile_name) {
        Some(profile) => profile,
        // An explicitly named profile must exist.
        None if global.profile.is_some() => {
            let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            });
        }
        None => &fallback,
    };

    let keys = if global.keys.is_empty() {
        cogs_config::resolve_keys(profile, &profile_name)?
    } else {
        global.keys.iter().cloned().map(SecretString::from).collect()
    };

    let profile = Profile {
        url: global.url.clone().or_else(|| profile.url.clone()),
        auto_reconnect: global.no_reconnect.then_some(false).or(profile.auto_reconnect),
        connect_timeout_ms: global.timeout.or(profile.connect_timeout_ms),
        session_uuid: global.session.or(profile.session_uuid),
        ..Profile::default()
    };
    let options = cogs_config::profile_to_options(&profile, &cfg.defaults)?;
    tracing::debug!(
        profile = %profile_name,
        url = %options.url,
        connect_timeout_ms = u64::try_from(options.connect_timeout.as_millis()).unwrap_or(u64::MAX),
        auto_reconnect = options.auto_reconnect,
        "resolved connection options"
    );

    Ok(Resolved {
        profile: profile_name,
        keys,
        options,
    })
}
