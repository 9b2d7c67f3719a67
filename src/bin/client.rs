use relay_mail::client::{self, ConsoleSink};
use relay_mail::common::codec;
use relay_mail::common::session::SessionHandle;
use relay_mail::{log_error, log_info};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

fn print_usage() {
    eprintln!("Usage: client [OPTIONS] <host> <username> <password>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --port <N>   Server port (default {})", codec::DEFAULT_PORT);
    eprintln!("  --verbose    Log wire traffic");
    eprintln!("  --help       Show this help message");
    eprintln!();
    eprintln!("Once connected, commands are: send, quit, help");
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String, String> {
    use std::io::Write;
    print!("{}", label);
    let _ = std::io::stdout().flush();

    lines
        .next_line()
        .await
        .map_err(|e| format!("Unable to read input: {}", e))?
        .map(|line| line.trim().to_string())
        .ok_or_else(|| "Input closed".to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Walks the user through composing one message and queues it for send
async fn compose_and_send(
    lines: &mut Lines<BufReader<Stdin>>,
    handle: &SessionHandle,
    username: &str,
    host: &str,
) -> Result<(), String> {
    let to = prompt(lines, "To (comma separated): ").await?;
    let cc = prompt(lines, "Cc (comma separated, empty for none): ").await?;
    let subject = prompt(lines, "Subject: ").await?;
    let encrypted = prompt(lines, "Encrypt body? (y/N): ")
        .await?
        .to_lowercase()
        .starts_with('y');

    log_info!("Body (finish with a single '.' line):");
    let mut body_lines = Vec::new();
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| format!("Unable to read input: {}", e))?
            .ok_or_else(|| "Input closed".to_string())?;
        if line == codec::DATA_TERMINATOR {
            break;
        }
        body_lines.push(line);
    }

    let sender = format!("{}@{}", username, host);
    let mail = client::compose(
        &sender,
        split_list(&to),
        split_list(&cc),
        &subject,
        &body_lines.join("\n"),
        encrypted,
    );

    if client::send(handle, mail) {
        log_info!("Message queued for send");
        Ok(())
    } else {
        Err("Session is closed".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    relay_mail::logging::init_from_env();
    let args: Vec<String> = std::env::args().collect();

    let mut port = codec::DEFAULT_PORT;
    let mut positional = Vec::new();

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--verbose" => relay_mail::logging::set_verbose(true),
            "--port" => {
                let value = iter.next().ok_or("--port requires a value")?;
                port = value.parse().map_err(|_| format!("Invalid port: {}", value))?;
            }
            s if s.starts_with('-') => {
                eprintln!("Unknown option: {}", s);
                print_usage();
                std::process::exit(1);
            }
            value => positional.push(value.to_string()),
        }
    }

    if positional.len() != 3 {
        print_usage();
        std::process::exit(1);
    }
    let host = positional[0].clone();
    let username = positional[1].clone();
    let password = positional[2].clone();

    let handle = client::connect(&host, port, &username, &password, Arc::new(ConsoleSink)).await?;
    log_info!("Logged in as {}. Commands: send, quit, help", username);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => {
                client::disconnect(&handle);
                break;
            }
        };

        match line.trim() {
            "" => continue,
            "help" => log_info!("Commands: send (compose a message), quit (log out), help"),
            "quit" => {
                client::disconnect(&handle);
                break;
            }
            "send" => {
                if let Err(err) = compose_and_send(&mut lines, &handle, &username, &host).await {
                    log_error!("{}", err);
                }
            }
            other => log_info!("Unknown command: {} (try help)", other),
        }

        if !handle.is_connected() {
            log_info!("Session closed");
            break;
        }
    }

    // let the QUIT exchange finish before the process exits
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
