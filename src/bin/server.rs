use relay_mail::server::config::{get_storage_path, user_data_path, ServerConfig};
use relay_mail::server::{AuthStore, Server};
use relay_mail::{log_error, log_info};
use std::io::{self, Write};
use std::path::PathBuf;

fn print_usage() {
    eprintln!("Usage: server [OPTIONS] [STORAGE_PATH]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --port <N>         Listen port (overrides config)");
    eprintln!("  --no-security      Accept any credentials at login");
    eprintln!("  --add-user         Interactively add a user, then exit");
    eprintln!("  --sample-config    Print a sample configuration file");
    eprintln!("  --verbose          Log wire traffic");
    eprintln!("  --help             Show this help message");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  STORAGE_PATH       Path to storage directory (default: current directory)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RELAY_MAIL_STORAGE_PATH  Alternative way to set storage path");
    eprintln!("  RELAY_MAIL_PORT          Overrides the configured port");
    eprintln!("  RELAY_MAIL_HOSTNAME      Overrides the configured hostname");
    eprintln!("  RELAY_MAIL_SECURITY      Set to 0/false to disable authentication");
}

/// Prompts for a username and password pair on the console
///
/// Note: input is not hidden; for that we'd need a crate like rpassword.
fn add_user_interactive(auth: &AuthStore) -> Result<(), String> {
    print!("Username: ");
    let _ = io::stdout().flush();

    let mut username = String::new();
    io::stdin()
        .read_line(&mut username)
        .map_err(|e| format!("Unable to read input: {}", e))?;
    let username = username.trim();
    if username.is_empty() {
        return Err("Username cannot be empty".to_string());
    }

    print!("Password: ");
    let _ = io::stdout().flush();
    let mut password = String::new();
    io::stdin()
        .read_line(&mut password)
        .map_err(|e| format!("Unable to read input: {}", e))?;
    let password = password.trim();
    if password.is_empty() {
        return Err("Password cannot be empty".to_string());
    }

    print!("Confirm password: ");
    let _ = io::stdout().flush();
    let mut confirm = String::new();
    io::stdin()
        .read_line(&mut confirm)
        .map_err(|e| format!("Unable to read input: {}", e))?;
    if password != confirm.trim() {
        return Err("Passwords do not match".to_string());
    }

    auth.add_user(username, password)?;
    println!("Added user {}", username);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();

    let mut storage_path: Option<PathBuf> = None;
    let mut port_override: Option<u16> = None;
    let mut no_security = false;
    let mut add_user = false;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--sample-config" => {
                println!("{}", ServerConfig::sample());
                return Ok(());
            }
            "--verbose" => relay_mail::logging::set_verbose(true),
            "--no-security" => no_security = true,
            "--add-user" => add_user = true,
            "--port" => {
                let value = iter.next().ok_or("--port requires a value")?;
                port_override = Some(value.parse().map_err(|_| format!("Invalid port: {}", value))?);
            }
            s if s.starts_with('-') => {
                eprintln!("Unknown option: {}", s);
                print_usage();
                std::process::exit(1);
            }
            path => {
                if storage_path.is_none() {
                    storage_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: Multiple storage paths specified");
                    print_usage();
                    std::process::exit(1);
                }
            }
        }
    }

    relay_mail::logging::init_from_env();

    let storage = storage_path.unwrap_or_else(get_storage_path);
    let mut config = ServerConfig::load(&storage).await?;
    if let Some(port) = port_override {
        config.port = port;
    }
    if no_security {
        config.security = false;
    }

    if add_user {
        let auth = AuthStore::new()?;
        let path = user_data_path(&storage);
        if let Err(err) = auth.load(&path).await {
            log_error!("{}", err);
        }
        add_user_interactive(&auth)?;
        auth.save(&path).await?;
        return Ok(());
    }

    let server = Server::start(config, storage).await?;
    log_info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.shutdown().await?;
    log_info!("Server stopped");
    Ok(())
}
