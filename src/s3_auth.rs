/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Issues S3 gateway credentials for the k6 S3 scenarios and installs them on every load node.

use crate::{
    config::SshSettings,
    errors::ShellError,
    runner::K6Dir,
    shell::Shell,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

const DEFAULT_NEO_GO: &str = "neo-go";
const DEFAULT_AUTHMATE: &str = "neofs-s3-authmate";
const PASSPHRASE_ENV: &str = "AUTHMATE_WALLET_PASSPHRASE";

fn default_neo_go() -> String {
    DEFAULT_NEO_GO.to_string()
}

fn default_authmate() -> String {
    DEFAULT_AUTHMATE.to_string()
}

/// `[s3]` section of the config.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct S3Settings {
    /// Storage node whose wallet key becomes the gate public key.
    pub storage_host: String,
    /// Wallet of the storage node, on the storage node.
    pub wallet_path: String,
    /// RPC endpoint of the storage node used as authmate peer.
    pub rpc_endpoint: String,
    pub container_placement_policy: String,
    #[serde(default)]
    pub wallet_password: String,
    #[serde(default = "default_neo_go")]
    pub neo_go_path: String,
    #[serde(default = "default_authmate")]
    pub authmate_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueSecret {
    pub wallet: String,
    pub wallet_password: String,
    pub peer: String,
    pub bearer_rules: String,
    pub gate_public_key: String,
    pub container_placement_policy: String,
    pub container_policy: String,
}
impl IssueSecret {
    pub fn command(&self, authmate: &str) -> Result<String, ShellError> {
        let quote = |value: &str| shlex::try_quote(value).map(|q| q.into_owned());
        Ok(format!(
            "{env}={password} {authmate} issue-secret --wallet {wallet} --peer {peer} \
             --bearer-rules {rules} --gate-public-key {key} \
             --container-placement-policy {placement} --container-policy {policy}",
            env = PASSPHRASE_ENV,
            password = quote(&self.wallet_password)?,
            authmate = authmate,
            wallet = quote(&self.wallet)?,
            peer = quote(&self.peer)?,
            rules = quote(&self.bearer_rules)?,
            key = quote(&self.gate_public_key)?,
            placement = quote(&self.container_placement_policy)?,
            policy = quote(&self.container_policy)?,
        ))
    }
}

#[derive(Clone, PartialEq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}
impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

fn capture(pattern: &str, group: &str, output: &str, command: &str) -> Result<String, ShellError> {
    let unexpected = || ShellError::UnexpectedOutput {
        command: command.to_string(),
        output: output.to_string(),
    };
    let re = Regex::new(pattern).map_err(|_| unexpected())?;
    re.captures(output)
        .and_then(|caps| caps.name(group))
        .map(|m| m.as_str().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(unexpected)
}

/// Public key of the first account in `wallet`.
pub fn dump_public_key<S: Shell + ?Sized>(
    shell: &S,
    neo_go: &str,
    wallet: &str,
) -> Result<String, ShellError> {
    let command = format!("{} wallet dump-keys -w {}", neo_go, wallet);
    let terminal = shell.exec(&command)?;
    capture(r":\n(?P<public_key>.*)", "public_key", &terminal.stdout, &command)
        .map(|key| key.trim().to_string())
}

/// Pulls the key pair out of `issue-secret` output.
pub fn parse_credentials(output: &str) -> Result<S3Credentials, ShellError> {
    let command = "issue-secret";
    Ok(S3Credentials {
        access_key_id: capture(
            r"access_key_id.*:\s.(?P<access_key_id>\w*)",
            "access_key_id",
            output,
            command,
        )?,
        secret_access_key: capture(
            r"secret_access_key.*:\s.(?P<secret_access_key>\w*)",
            "secret_access_key",
            output,
            command,
        )?,
    })
}

pub fn issue_secret<S: Shell + ?Sized>(
    shell: &S,
    authmate: &str,
    request: &IssueSecret,
) -> Result<S3Credentials, ShellError> {
    let terminal = shell.exec(&request.command(authmate)?)?;
    parse_credentials(&terminal.stdout)
}

/// Stores the credentials as the default aws cli profile of the shell's user.
pub fn configure_aws<S: Shell + ?Sized>(
    shell: &S,
    credentials: &S3Credentials,
) -> Result<(), ShellError> {
    shell.exec(&format!(
        "aws configure set aws_access_key_id {}",
        shlex::try_quote(&credentials.access_key_id)?
    ))?;
    shell.exec(&format!(
        "aws configure set aws_secret_access_key {}",
        shlex::try_quote(&credentials.secret_access_key)?
    ))?;
    Ok(())
}

/// Issues a secret on every load node with the wallet and policies shipped with its k6
/// scenarios, then configures the aws cli there.
pub fn init_s3_client(
    load_hosts: &[String],
    ssh: &SshSettings,
    settings: &S3Settings,
) -> Result<(), ShellError> {
    let storage_shell = ssh.shell_for(&settings.storage_host);
    init_s3_client_with(load_hosts, |host| ssh.shell_for(host), &storage_shell, settings)
}

pub fn init_s3_client_with<L, S, F>(
    load_hosts: &[String],
    mut shell_for: F,
    storage_shell: &S,
    settings: &S3Settings,
) -> Result<(), ShellError>
where
    L: Shell,
    S: Shell + ?Sized,
    F: FnMut(&str) -> L,
{
    let public_key = dump_public_key(storage_shell, &settings.neo_go_path, &settings.wallet_path)?;

    for host in load_hosts {
        let shell = shell_for(host);
        let dir = K6Dir::Find.resolve(&shell)?;

        let credentials = issue_secret(
            &shell,
            &settings.authmate_path,
            &IssueSecret {
                wallet: format!("{}/scenarios/files/wallet.json", dir),
                wallet_password: settings.wallet_password.clone(),
                peer: settings.rpc_endpoint.clone(),
                bearer_rules: format!("{}/scenarios/files/rules.json", dir),
                gate_public_key: public_key.clone(),
                container_placement_policy: settings.container_placement_policy.clone(),
                container_policy: format!("{}/scenarios/files/policy.json", dir),
            },
        )?;
        configure_aws(&shell, &credentials)?;
        info!("S3 credentials are configured on {}", host);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeShell;

    const DUMP_KEYS: &str = "NTh9TnZTstvAePEYWDGLLxidBikJE24uTo (simple signature contract):\n\
                             02b3622bf4017bdfe317c58aed5f4c753f206b7db896046fa7d774bbc4bf7f8dc2\n";

    const ISSUE_SECRET: &str = r#"{
  "access_key_id": "5g933dyLEkXbbAspouhPPTiyLZRg4axBW1axSPD87eVT_AiXsH4AjYy1iTJ4C1WExzjBrSobJsQFWEyKLREe5sQYM",
  "secret_access_key": "438bbd8243060e1e1c9dd4821756914a6e872ce29bf203b68f81b140ba91a265",
  "owner_private_key": "274fdd6e71fc6a6b8fe77bec500254115d66d6d17347d7db0880d2eb80afc72a",
  "container_id":"5ax8gFxZsUhC3vWYJ17bLsCSKcEeJdT8SjAF2jhhNeE5"
}"#;

    fn settings() -> S3Settings {
        S3Settings {
            storage_host: "s01".to_string(),
            wallet_path: "/etc/neofs/storage/wallet.json".to_string(),
            rpc_endpoint: "s01.neofs.devenv:8080".to_string(),
            container_placement_policy: "REP 1".to_string(),
            wallet_password: String::new(),
            neo_go_path: default_neo_go(),
            authmate_path: default_authmate(),
        }
    }

    #[test]
    fn public_key_is_line_after_account() -> anyhow::Result<()> {
        let shell = FakeShell::new().respond("dump-keys", DUMP_KEYS);

        let key = dump_public_key(&shell, "neo-go", "/w.json")?;

        assert_eq!(
            key,
            "02b3622bf4017bdfe317c58aed5f4c753f206b7db896046fa7d774bbc4bf7f8dc2"
        );
        assert_eq!(shell.commands(), vec!["neo-go wallet dump-keys -w /w.json".to_string()]);
        Ok(())
    }

    #[test]
    fn credentials_are_parsed_from_issue_secret() -> anyhow::Result<()> {
        let creds = parse_credentials(ISSUE_SECRET)?;

        assert!(creds.access_key_id.starts_with("5g933dyLEkXbbAspouhPPTiyLZRg4axBW1axSPD87eVT_"));
        assert_eq!(
            creds.secret_access_key,
            "438bbd8243060e1e1c9dd4821756914a6e872ce29bf203b68f81b140ba91a265"
        );
        assert!(!format!("{:?}", creds).contains("438bbd82"));
        Ok(())
    }

    #[test]
    fn garbage_output_is_rejected() {
        let res = parse_credentials("authmate: wallet is locked");
        assert!(matches!(res, Err(ShellError::UnexpectedOutput { .. })));
    }

    #[test]
    fn every_load_node_gets_credentials() -> anyhow::Result<()> {
        let storage = FakeShell::new().respond("dump-keys", DUMP_KEYS);
        let load = FakeShell::new()
            .respond("sudo find", "./xk6-neofs\n")
            .respond("issue-secret", ISSUE_SECRET);
        let hosts = vec!["load-1".to_string(), "load-2".to_string()];

        init_s3_client_with(&hosts, |_| load.clone(), &storage, &settings())?;

        let commands = load.commands();
        let issued = commands
            .iter()
            .filter(|c| c.contains("issue-secret"))
            .collect::<Vec<_>>();
        assert_eq!(issued.len(), 2);
        assert!(issued[0].starts_with("AUTHMATE_WALLET_PASSPHRASE="));
        assert!(issued[0].contains(" neofs-s3-authmate issue-secret "));
        assert!(issued[0].contains("--wallet ./xk6-neofs/scenarios/files/wallet.json"));
        assert!(issued[0].contains("--gate-public-key 02b3622b"));
        assert!(issued[0].contains("--container-placement-policy "));
        assert!(issued[0].contains("REP 1"));
        assert!(issued[0].contains("--container-policy ./xk6-neofs/scenarios/files/policy.json"));

        assert_eq!(
            commands
                .iter()
                .filter(|c| c.starts_with("aws configure set"))
                .count(),
            4
        );
        assert_eq!(storage.commands().len(), 1);
        Ok(())
    }
}
