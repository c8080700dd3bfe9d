//! The wire command that downloads and runs a setup/scoring script.

use std::collections::BTreeMap;

use crate::runtime::escape_single_quotes;

/// Render environment assignments as a `KEY="value"` prefix.
///
/// Keys are emitted in sorted order so the generated command is stable.
pub fn set_envs(envs: &BTreeMap<String, String>) -> String {
    envs.iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the command that fetches a script (curl, falling back to wget)
/// with the access token as an `Authorization` cookie and pipes it into
/// bash with the environment prefixed.
pub fn build_script_command(
    script_url: &str,
    access_token: &str,
    envs: &BTreeMap<String, String>,
) -> String {
    let url = escape_single_quotes(script_url);
    let cookie = format!("Cookie: Authorization={access_token}");
    let env_prefix = set_envs(envs);

    format!(
        "(curl -fsSL --header '{cookie}' '{url}' || \
         wget --header='{cookie}' -qO- '{url}') | {env_prefix} bash -s --"
    )
}
