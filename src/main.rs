#![forbid(unsafe_code)]

mod build;
mod checksum;
mod client;
mod error;
mod manifest;
mod output;
mod prelude;
mod registry;
mod tree;
mod util;
mod vendor;
mod vocab;


use crate::prelude::*;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "island", version, about = "Build, vendor, register, and install island packages")]
struct Cli {
    #[command(flatten)]
    output: output::OutputArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a .island binary distribution (vendoring dependencies if any).
    Build {
        /// Project configuration file.
        #[arg(long, default_value = "island.toml")]
        config: PathBuf,
        /// Directory to write artifacts into.
        #[arg(long, short, default_value = "dist")]
        output: PathBuf,
        /// Also build a source distribution.
        #[arg(long)]
        sdist: bool,
        /// Skip dependency vendoring even if dependencies are declared.
        #[arg(long)]
        no_vendor: bool,
    },
    /// Vendor the configured dependencies into a directory without
    /// building an archive.
    Vendor {
        #[arg(long, default_value = "island.toml")]
        config: PathBuf,
        /// Directory to vendor packages into.
        #[arg(long, short, default_value = "vendor")]
        output: PathBuf,
    },
    /// Register built artifacts with the registry (assets must already be
    /// published at an HTTPS origin).
    Register {
        /// Artifact files to register.
        files: Vec<PathBuf>,
        #[arg(long, default_value = "island.toml")]
        config: PathBuf,
        /// Base URL under which the artifacts are hosted.
        #[arg(long)]
        url_base: String,
        #[arg(long, env = "ISLAND_REGISTRY", default_value = "https://islands.archipelago.gg/v1/island")]
        registry: String,
        #[arg(long, env = "ISLAND_TOKEN")]
        token: String,
    },
    /// Download a package from its origin, verifying the registry checksum.
    Install {
        package: String,
        #[arg(long, short = 'V')]
        version: Option<String>,
        #[arg(long, short)]
        platform: Option<String>,
        #[arg(long, short, default_value = ".")]
        output: PathBuf,
        #[arg(long, env = "ISLAND_REGISTRY", default_value = "https://islands.archipelago.gg/v1/island")]
        registry: String,
    },
    /// Run the registry service.
    Serve {
        /// Registry configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        bind: Option<SocketAddr>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Mint an API token and store its hash in the registry database.
    Token {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "upload")]
        scopes: String,
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    output::init(&cli.output);
    if let Err(err) = run(cli.command) {
        if let Some(error::IslandError::ChecksumMismatch { .. }) =
            err.downcast_ref::<error::IslandError>()
        {
            output::error(&format!("{err:#}"));
            std::process::exit(2);
        }
        output::error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Build {
            config,
            output,
            sdist,
            no_vendor,
        } => {
            let config = build::BuildConfig::from_path(&config)?;
            validate_entry_points(&config.entry_points)?;

            let result = if config.dependencies.is_empty() || no_vendor {
                build::build_island(
                    &config,
                    &output,
                    build::BuildOptions::default(),
                )?
            } else {
                vendor::build_island_with_vendoring(
                    &config,
                    &output,
                    &vendor::PipWheelFetcher::default(),
                )?
            };
            output::success(&format!(
                "built {} ({} bytes, {} files)",
                result.filename,
                result.size,
                result.files_included.len()
            ));

            if sdist {
                let sdist_result = build::build_sdist(&config, &output, None)?;
                output::success(&format!(
                    "built {} ({} bytes)",
                    sdist_result.filename, sdist_result.size
                ));
            }
            Ok(())
        }
        Command::Vendor { config, output } => {
            let config = build::BuildConfig::from_path(&config)?;
            if config.dependencies.is_empty() {
                output::warning("island.toml declares no dependencies; nothing to vendor");
                return Ok(());
            }
            let vendor_config = vendor::VendorConfig::new(
                &config.normalized_name(),
                config.dependencies.clone(),
                config.vendor_exclude.clone(),
            );
            let outcome = vendor::vendor_dependencies(
                &vendor_config,
                &output,
                &vendor::PipWheelFetcher::default(),
            )?;
            if outcome.packages.is_empty() {
                output::warning("all dependencies were excluded; nothing vendored");
                return Ok(());
            }
            let modules = outcome.vendored_module_names();
            vendor::rewrite_tree(
                &output,
                &modules,
                &vendor_config.vendor_namespace(),
                &vendor::CORE_HOST_MODULES,
            )?;
            vendor::VendorManifest::from_outcome(&outcome)
                .write(&output.join("vendor_manifest.json"))?;
            output::success(&format!(
                "vendored {} package(s) into {}",
                outcome.packages.len(),
                output.display()
            ));
            Ok(())
        }
        Command::Register {
            files,
            config,
            url_base,
            registry,
            token,
        } => {
            let config = build::BuildConfig::from_path(&config)?;
            let file_refs: Vec<&std::path::Path> =
                files.iter().map(|p| p.as_path()).collect();
            let payload = client::build_registration(&config, &file_refs, &url_base)?;
            let response = client::submit_registration(&registry, &token, &payload)?;
            output::success(&format!(
                "registered {} {} ({})",
                response.package_name,
                response.version,
                response.registered_distributions.join(", ")
            ));
            Ok(())
        }
        Command::Install {
            package,
            version,
            platform,
            output: output_dir,
            registry,
        } => {
            let report = client::install(
                &registry,
                &package,
                version.as_deref(),
                platform.as_deref(),
                &output_dir,
            )?;
            output::success(&format!(
                "installed {} v{} ({} bytes, sha256 {})",
                report.filename, report.version, report.bytes, report.sha256
            ));
            Ok(())
        }
        Command::Serve { config, bind, db } => {
            let mut registry_config = match config {
                Some(path) => registry::RegistryConfig::from_path(&path)?,
                None => registry::RegistryConfig::default(),
            };
            if let Some(bind) = bind {
                registry_config.bind = bind;
            }
            if let Some(db) = db {
                registry_config.db_path = db;
            }
            tokio::runtime::Runtime::new()?.block_on(registry::serve(registry_config))
        }
        Command::Token {
            db,
            user,
            scopes,
            name,
        } => {
            let store = registry::RegistryStore::open(&db)?;
            let (token, hash) = registry::generate_token()?;
            store.put_token(&registry::TokenRecord {
                token_hash: hash,
                user_id: user.clone(),
                name,
                scopes,
                created_at: chrono::Utc::now(),
                expires_at: None,
                last_used_at: None,
                revoked: false,
            })?;
            output::success(&format!("issued token for {user} (store this; it is not recoverable):"));
            println!("{token}");
            Ok(())
        }
    }
}
