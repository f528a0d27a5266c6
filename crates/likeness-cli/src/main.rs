use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates both `FacesProxy` (async) and
// `FacesProxyBlocking`. The CLI uses the async variant.
#[zbus::proxy(
    interface = "org.likeness.Faces1",
    default_service = "org.likeness.Faces1",
    default_path = "/org/likeness/Faces1"
)]
trait Faces {
    async fn register_photo(&self, owner_id: i64, storage_path: &str) -> zbus::Result<i64>;
    async fn submit(&self, photo_id: i64) -> zbus::Result<String>;
    async fn status(&self, photo_id: i64) -> zbus::Result<String>;
    async fn create_identity(&self, detection_id: i64, name: &str) -> zbus::Result<i64>;
    async fn rename_identity(&self, identity_id: i64, name: &str) -> zbus::Result<()>;
    async fn deactivate_identity(&self, identity_id: i64) -> zbus::Result<()>;
    async fn list_photos(&self, owner_id: i64) -> zbus::Result<String>;
    async fn list_detections(&self, photo_id: i64) -> zbus::Result<String>;
    async fn list_identities(&self, owner_id: i64) -> zbus::Result<String>;
    async fn identity_photos(&self, identity_id: i64) -> zbus::Result<String>;
    async fn daemon_status(&self) -> zbus::Result<String>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face tagging CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a photo file for an owner
    Register {
        /// Path to the image file
        path: String,
        #[arg(short, long, default_value_t = 1)]
        owner: i64,
    },
    /// Detect and tag faces in a registered photo
    Process {
        photo_id: i64,
        /// Wait for the job to finish
        #[arg(short, long)]
        wait: bool,
    },
    /// Show the job state of a photo
    Status { photo_id: i64 },
    /// List an owner's photos
    Photos {
        #[arg(short, long, default_value_t = 1)]
        owner: i64,
    },
    /// List faces detected in a photo
    Faces { photo_id: i64 },
    /// List an owner's people
    People {
        #[arg(short, long, default_value_t = 1)]
        owner: i64,
    },
    /// Create a person from a detected face
    Name {
        detection_id: i64,
        /// Display name (optional)
        name: Option<String>,
    },
    /// Rename a person
    Rename { identity_id: i64, name: String },
    /// Stop matching new faces against a person
    Forget { identity_id: i64 },
    /// List photos a person appears in
    Appearances { identity_id: i64 },
    /// Show daemon status
    DaemonStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = FacesProxy::new(&conn)
        .await
        .context("likenessd is not reachable")?;

    match cli.command {
        Commands::Register { path, owner } => {
            let absolute = std::fs::canonicalize(&path).with_context(|| format!("cannot resolve {path}"))?;
            let photo_id = proxy
                .register_photo(owner, &absolute.to_string_lossy())
                .await?;
            println!("registered photo {photo_id}");
        }
        Commands::Process { photo_id, wait } => {
            let state = proxy.submit(photo_id).await?;
            if !wait {
                print_json(&state)?;
                return Ok(());
            }
            loop {
                let status = proxy.status(photo_id).await?;
                let parsed: serde_json::Value = serde_json::from_str(&status)?;
                match parsed["state"].as_str() {
                    Some("DONE") => break,
                    Some("FAILED") => bail!(
                        "photo {photo_id} failed: {}",
                        parsed["error"].as_str().unwrap_or("unknown error")
                    ),
                    state => {
                        tracing::debug!(photo_id, ?state, "waiting for job");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
            print_json(&proxy.list_detections(photo_id).await?)?;
        }
        Commands::Status { photo_id } => print_json(&proxy.status(photo_id).await?)?,
        Commands::Photos { owner } => print_json(&proxy.list_photos(owner).await?)?,
        Commands::Faces { photo_id } => print_json(&proxy.list_detections(photo_id).await?)?,
        Commands::People { owner } => print_json(&proxy.list_identities(owner).await?)?,
        Commands::Name { detection_id, name } => {
            let identity = proxy
                .create_identity(detection_id, name.as_deref().unwrap_or(""))
                .await?;
            println!("created person {identity}");
        }
        Commands::Rename { identity_id, name } => {
            proxy.rename_identity(identity_id, &name).await?;
            println!("renamed person {identity_id}");
        }
        Commands::Forget { identity_id } => {
            proxy.deactivate_identity(identity_id).await?;
            println!("person {identity_id} will no longer be matched");
        }
        Commands::Appearances { identity_id } => {
            print_json(&proxy.identity_photos(identity_id).await?)?
        }
        Commands::DaemonStatus => print_json(&proxy.daemon_status().await?)?,
    }

    Ok(())
}

/// Pretty-print a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
