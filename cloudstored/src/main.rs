use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cloudstore_core::{AuthChallenge, Path};
use cloudstored::config::StoreConfig;
use cloudstored::storage::{KeyringPasswords, PasswordPrompt};
use cloudstored::store::{Account, ResourceStore};
use cloudstored::sync::{AccountSession, EventSink, PasswordSource, SyncEvent};
use serde_json::json;
use tracing_subscriber::FmtSubscriber;
use url::Url;

const USAGE: &str = "Usage: cloudstored [COMMAND]
  (no command)                      Refresh the root of every account
  accounts                          List accounts
  add <url> <username>              Add an account rooted at <url>
  remove <account-id>               Remove an account and its cached files
  refresh <account-id> [path]       Refresh one resource (default: root)
  download <account-id> <path>      Download a file into the cache
  --help                            Show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    RefreshAll,
    Accounts,
    Add { url: Url, username: String },
    Remove { account_id: String },
    Refresh { account_id: String, path: Path },
    Download { account_id: String, path: Path },
    Help,
}

fn parse_command<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match args.as_slice() {
        [] => Command::RefreshAll,
        ["--help" | "-h"] => Command::Help,
        ["accounts"] => Command::Accounts,
        ["add", url, username] => Command::Add {
            url: Url::parse(url).with_context(|| format!("invalid account url: {url}"))?,
            username: username.to_string(),
        },
        ["remove", account_id] => Command::Remove {
            account_id: account_id.to_string(),
        },
        ["refresh", account_id] => Command::Refresh {
            account_id: account_id.to_string(),
            path: Path::root(),
        },
        ["refresh", account_id, path] => Command::Refresh {
            account_id: account_id.to_string(),
            path: Path::from_href(path),
        },
        ["download", account_id, path] => Command::Download {
            account_id: account_id.to_string(),
            path: Path::from_href(path),
        },
        [command @ ("add" | "remove" | "refresh" | "download"), ..] => {
            anyhow::bail!("wrong number of arguments for {command}")
        }
        [other, ..] => anyhow::bail!("unknown argument: {other}"),
    };
    Ok(command)
}

/// Reads a password from standard input.
struct TerminalPrompt;

#[async_trait]
impl PasswordPrompt for TerminalPrompt {
    async fn ask(&self, username: &str, challenge: &AuthChallenge) -> Option<String> {
        let prompt = match &challenge.realm {
            Some(realm) => format!("Password for {username} at {} ({realm}): ", challenge.url),
            None => format!("Password for {username} at {}: ", challenge.url),
        };
        tokio::task::spawn_blocking(move || {
            eprint!("{prompt}");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok()?;
            let password = line.trim_end_matches(['\r', '\n']).to_string();
            (!password.is_empty()).then_some(password)
        })
        .await
        .ok()
        .flatten()
    }
}

struct Cli {
    config: StoreConfig,
    store: Arc<ResourceStore>,
    passwords: Arc<KeyringPasswords>,
}

impl Cli {
    async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Help => println!("{USAGE}"),
            Command::Accounts => {
                for account in self.store.list_accounts().await? {
                    println!("{}", serde_json::to_string(&account)?);
                }
            }
            Command::Add { url, username } => {
                let account = self.store.add_account(&url, &username, None).await?;
                println!("{}", serde_json::to_string(&account)?);
            }
            Command::Remove { account_id } => {
                let account = self.account(&account_id).await?;
                let changes = self.store.remove_account(&account_id).await?;
                let shared = self
                    .store
                    .list_accounts()
                    .await?
                    .iter()
                    .any(|other| other.username == account.username);
                if !shared {
                    self.passwords.delete_password(&account.username)?;
                }
                println!(
                    "{}",
                    json!({ "account_id": account_id, "changes": changes })
                );
            }
            Command::RefreshAll => {
                for account in self.store.list_accounts().await? {
                    self.refresh(account, Path::root()).await?;
                }
            }
            Command::Refresh { account_id, path } => {
                let account = self.account(&account_id).await?;
                self.refresh(account, path).await?;
            }
            Command::Download { account_id, path } => {
                let account = self.account(&account_id).await?;
                self.download(account, path).await?;
            }
        }
        Ok(())
    }

    async fn account(&self, account_id: &str) -> anyhow::Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .with_context(|| format!("unknown account: {account_id}"))
    }

    fn session(&self, account: Account) -> (AccountSession, tokio::sync::mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = EventSink::channel();
        let passwords: Arc<dyn PasswordSource> = self.passwords.clone();
        let session = AccountSession::connect(
            account,
            self.store.clone(),
            passwords,
            self.config.download_concurrency,
            events,
        );
        (session, rx)
    }

    async fn refresh(&self, account: Account, path: Path) -> anyhow::Result<()> {
        let id = account.resource(path);
        let (session, mut rx) = self.session(account);
        session
            .metadata
            .refresh(&id)
            .await
            .with_context(|| format!("refresh of {id} failed"))?;

        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::ResourcesChanged {
                account_id,
                changes,
            } = event
            {
                println!(
                    "{}",
                    json!({ "account_id": account_id, "changes": changes })
                );
            }
        }
        Ok(())
    }

    async fn download(&self, account: Account, path: Path) -> anyhow::Result<()> {
        let id = account.resource(path);
        let (session, mut rx) = self.session(account);

        if self.store.get(&id).await?.is_none() {
            let listed = id.parent().unwrap_or_else(|| id.clone());
            session.metadata.refresh(&listed).await?;
        }
        session.content.start_download(&id).await?;

        while let Some(event) = rx.recv().await {
            match event {
                SyncEvent::DownloadFinished { resource_id } if resource_id == id => {
                    let file = self
                        .store
                        .get(&id)
                        .await?
                        .and_then(|resource| resource.file_path);
                    println!("{}", json!({ "resource": id, "file": file }));
                    return Ok(());
                }
                SyncEvent::DownloadFailed { resource_id, error } if resource_id == id => {
                    return Err(error).with_context(|| format!("download of {id} failed"));
                }
                SyncEvent::DownloadCancelled { resource_id } if resource_id == id => {
                    anyhow::bail!("download of {id} was cancelled");
                }
                _ => {}
            }
        }
        anyhow::bail!("download of {id} ended without a result")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let command = parse_command(std::env::args())?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = StoreConfig::from_env()?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = Arc::new(ResourceStore::new(&config.data_dir));
    store
        .open()
        .await
        .with_context(|| format!("failed to open store at {:?}", config.data_dir))?;
    let passwords = Arc::new(
        KeyringPasswords::new(config.keyring_service.clone()).with_prompt(Arc::new(TerminalPrompt)),
    );

    let cli = Cli {
        config,
        store: store.clone(),
        passwords,
    };
    let result = cli.run(command).await;
    store.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Command> {
        parse_command(
            std::iter::once("cloudstored")
                .chain(args.iter().copied())
                .map(str::to_string),
        )
    }

    #[test]
    fn no_arguments_refreshes_everything() {
        assert_eq!(parse(&[]).unwrap(), Command::RefreshAll);
    }

    #[test]
    fn parses_help_and_accounts() {
        assert_eq!(parse(&["--help"]).unwrap(), Command::Help);
        assert_eq!(parse(&["-h"]).unwrap(), Command::Help);
        assert_eq!(parse(&["accounts"]).unwrap(), Command::Accounts);
    }

    #[test]
    fn parses_account_commands() {
        assert_eq!(
            parse(&["add", "https://x/dav/", "alice"]).unwrap(),
            Command::Add {
                url: Url::parse("https://x/dav/").unwrap(),
                username: "alice".into(),
            }
        );
        assert_eq!(
            parse(&["remove", "id-1"]).unwrap(),
            Command::Remove {
                account_id: "id-1".into()
            }
        );
        assert!(parse(&["add", "not a url", "alice"]).is_err());
    }

    #[test]
    fn parses_resource_paths() {
        assert_eq!(
            parse(&["refresh", "id-1"]).unwrap(),
            Command::Refresh {
                account_id: "id-1".into(),
                path: Path::root(),
            }
        );
        assert_eq!(
            parse(&["download", "id-1", "/docs/a.txt"]).unwrap(),
            Command::Download {
                account_id: "id-1".into(),
                path: Path::new(["docs", "a.txt"]).unwrap(),
            }
        );
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        assert!(parse(&["--logout"]).is_err());
        assert!(parse(&["download", "id-1"]).is_err());
        assert!(parse(&["refresh", "a", "b", "c"]).is_err());
    }
}
