use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "lookout", about = "Lookout missing-persons face registry CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Add {
        /// Full name
        #[arg(short, long)]
        name: String,
        /// Photo with exactly one visible face (png, jpeg, gif, webp)
        photo: PathBuf,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Show one person
    Get { id: i64 },
    /// List all persons
    List,
    /// Remove a person
    Remove { id: i64 },
    /// Change a person's details (unspecified fields are kept)
    Update {
        id: i64,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Search the registry with a photo
    Search {
        photo: PathBuf,
        /// Maximum face distance for a match (daemon default if omitted)
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Show at most this many matches
        #[arg(short = 'k', long)]
        top_k: Option<u32>,
    },
    /// Compare the faces in two photos
    Compare {
        first: PathBuf,
        second: PathBuf,
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Show daemon status
    Status,
}

#[derive(Args, Default, Serialize, Deserialize)]
struct MetadataArgs {
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    age: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    date_missing: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<String>,
}

impl MetadataArgs {
    /// Fill unset fields from `current`.
    fn merged_over(self, current: MetadataArgs) -> MetadataArgs {
        MetadataArgs {
            age: self.age.or(current.age),
            description: self.description.or(current.description),
            date_missing: self.date_missing.or(current.date_missing),
            contact: self.contact.or(current.contact),
        }
    }
}

#[zbus::proxy(
    interface = "org.lookout.Registry1",
    default_service = "org.lookout.Registry1",
    default_path = "/org/lookout/Registry1"
)]
trait Registry {
    fn add_person(&self, name: &str, metadata_json: &str, photo: &[u8]) -> zbus::Result<i64>;
    fn get_person(&self, id: i64) -> zbus::Result<String>;
    fn list_persons(&self) -> zbus::Result<String>;
    fn remove_person(&self, id: i64) -> zbus::Result<()>;
    fn update_metadata(&self, id: i64, metadata_json: &str) -> zbus::Result<()>;
    fn search(&self, photo: &[u8], threshold: f64, top_k: u32) -> zbus::Result<String>;
    fn compare(&self, photo_a: &[u8], photo_b: &[u8], threshold: f64) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

/// Person fields as returned by the daemon.
#[derive(Deserialize)]
struct PersonJson {
    id: i64,
    name: String,
    #[serde(flatten)]
    metadata: MetadataArgs,
    photo_ref: Option<String>,
    created_at: String,
}

#[derive(Deserialize)]
struct MatchJson {
    #[serde(flatten)]
    person: PersonJson,
    distance: f32,
    confidence: f32,
    band: String,
}

#[derive(Deserialize)]
struct ComparisonJson {
    matched: bool,
    distance: f32,
    confidence: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RegistryProxy::new(&conn)
        .await
        .context("lookoutd is not reachable")?;
    tracing::debug!(system_bus = cli.system, "registry proxy ready");

    match cli.command {
        Commands::Add {
            name,
            photo,
            metadata,
        } => {
            let bytes = read_photo(&photo)?;
            let id = proxy
                .add_person(&name, &serde_json::to_string(&metadata)?, &bytes)
                .await?;
            println!("Added {name} as #{id}");
        }
        Commands::Get { id } => {
            let person: PersonJson = serde_json::from_str(&proxy.get_person(id).await?)?;
            print_person(&person);
        }
        Commands::List => {
            let persons: Vec<PersonJson> = serde_json::from_str(&proxy.list_persons().await?)?;
            if persons.is_empty() {
                println!("No persons registered");
            }
            for p in &persons {
                println!("#{:<5} {}", p.id, p.name);
            }
        }
        Commands::Remove { id } => {
            proxy.remove_person(id).await?;
            println!("Removed #{id}");
        }
        Commands::Update { id, metadata } => {
            let current: PersonJson = serde_json::from_str(&proxy.get_person(id).await?)?;
            let merged = metadata.merged_over(current.metadata);
            proxy
                .update_metadata(id, &serde_json::to_string(&merged)?)
                .await?;
            println!("Updated #{id}");
        }
        Commands::Search {
            photo,
            threshold,
            top_k,
        } => {
            let bytes = read_photo(&photo)?;
            let json = proxy
                .search(&bytes, threshold.unwrap_or(-1.0), top_k.unwrap_or(0))
                .await?;
            let matches: Vec<MatchJson> = serde_json::from_str(&json)?;
            if matches.is_empty() {
                println!("No matches found");
            }
            for (rank, m) in matches.iter().enumerate() {
                println!(
                    "{}. {} (#{}) {:.2}% [{}] distance {:.4}",
                    rank + 1,
                    m.person.name,
                    m.person.id,
                    m.confidence * 100.0,
                    m.band,
                    m.distance
                );
            }
        }
        Commands::Compare {
            first,
            second,
            threshold,
        } => {
            let a = read_photo(&first)?;
            let b = read_photo(&second)?;
            let json = proxy.compare(&a, &b, threshold.unwrap_or(-1.0)).await?;
            let cmp: ComparisonJson = serde_json::from_str(&json)?;
            println!(
                "{} (distance {:.4}, confidence {:.2}%)",
                if cmp.matched { "Same person" } else { "Different people" },
                cmp.distance,
                cmp.confidence * 100.0
            );
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_person(p: &PersonJson) {
    println!("#{} {}", p.id, p.name);
    let fields = [
        ("age", &p.metadata.age),
        ("description", &p.metadata.description),
        ("date missing", &p.metadata.date_missing),
        ("contact", &p.metadata.contact),
        ("photo", &p.photo_ref),
    ];
    for (label, value) in fields {
        if let Some(v) = value {
            println!("  {label:<13} {v}");
        }
    }
    println!("  {:<13} {}", "registered", p.created_at);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_search() {
        let cli = Cli::try_parse_from(["lookout", "search", "q.jpg", "-t", "0.5", "-k", "3"]).unwrap();
        match cli.command {
            Commands::Search { photo, threshold, top_k } => {
                assert_eq!(photo, PathBuf::from("q.jpg"));
                assert_eq!(threshold, Some(0.5));
                assert_eq!(top_k, Some(3));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_cli_add_requires_name() {
        assert!(Cli::try_parse_from(["lookout", "add", "p.png"]).is_err());
        let cli = Cli::try_parse_from([
            "lookout", "add", "p.png", "--name", "Ana", "--age", "30",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Add { .. }));
    }

    #[test]
    fn test_metadata_json_omits_unset_fields() {
        let m = MetadataArgs {
            age: Some("30".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&m).unwrap(), r#"{"age":"30"}"#);
    }

    #[test]
    fn test_update_merges_over_current() {
        let current = MetadataArgs {
            age: Some("30".into()),
            contact: Some("old".into()),
            ..Default::default()
        };
        let change = MetadataArgs {
            contact: Some("new".into()),
            ..Default::default()
        };
        let merged = change.merged_over(current);
        assert_eq!(merged.age.as_deref(), Some("30"));
        assert_eq!(merged.contact.as_deref(), Some("new"));
    }

    #[test]
    fn test_match_json_shape() {
        let json = r#"[{"id":4,"name":"Ana","age":"30","description":null,
            "date_missing":null,"contact":null,"photo_ref":"ab.png",
            "created_at":"2026-01-01T00:00:00+00:00",
            "distance":0.12,"confidence":0.8,"band":"high"}]"#;
        let parsed: Vec<MatchJson> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed[0].person.id, 4);
        assert_eq!(parsed[0].person.metadata.age.as_deref(), Some("30"));
        assert_eq!(parsed[0].band, "high");
    }
}
