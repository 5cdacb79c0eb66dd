mod image;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "station")]
#[command(about = "Solar station operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a firmware image to a station in configuration mode
    Upload {
        /// Station address (192.168.4.1 when it runs its own access point)
        host: String,
        /// Firmware image (.bin)
        firmware: PathBuf,
        #[arg(short, long, default_value = "80")]
        port: u16,
    },
    /// Replace a station's configuration with a JSON file
    Config {
        host: String,
        /// Flat JSON object with dotted keys
        file: PathBuf,
        #[arg(short, long, default_value = "80")]
        port: u16,
    },
    /// Show an image's descriptor and SHA-256
    Inspect {
        firmware: PathBuf,
        /// Also write the .sha256 sidecar the station checks on storage
        #[arg(long)]
        write_digest: bool,
    },
}

fn base_url(host: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{}", host)
    } else {
        format!("http://{}:{}", host, port)
    }
}

fn upload(host: &str, port: u16, firmware: &Path) -> Result<()> {
    let (data, info) = image::load(firmware)?;
    println!("{} Solar station firmware upload", "🚀".blue());
    println!("{}Station: {}", "   ".dimmed(), base_url(host, port));
    println!(
        "{}Image: {} {} ({} bytes)",
        "   ".dimmed(),
        info.descriptor.project_name,
        info.descriptor.version,
        info.size
    );

    let pb = ProgressBar::new(info.size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("#>-"),
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let body = reqwest::blocking::Body::sized(pb.wrap_read(Cursor::new(data)), info.size as u64);
    let response = client
        .post(format!("{}/upgrade", base_url(host, port)))
        .header("Content-Type", "application/octet-stream")
        .body(body)
        .send();
    pb.finish_and_clear();

    let response = response.context("upload failed")?;
    if !response.status().is_success() {
        bail!("station answered HTTP {}: {}", response.status(), response.text().unwrap_or_default());
    }
    println!("{} Upload successful! Station will restart.", "✅".green());
    Ok(())
}

fn push_config(host: &str, port: u16, file: &Path) -> Result<()> {
    let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    // The station replaces its whole document, so refuse anything it would reject
    let doc: serde_json::Value = serde_json::from_str(&text).context("configuration is not valid JSON")?;
    let Some(entries) = doc.as_object() else {
        bail!("configuration must be a JSON object");
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let response = client
        .post(format!("{}/", base_url(host, port)))
        .form(&[("config", text.as_str())])
        .send()
        .context("sending configuration")?;
    if !response.status().is_success() {
        bail!("station rejected the configuration (HTTP {})", response.status());
    }
    println!("{} {} settings saved", "✅".green(), entries.len());
    Ok(())
}

fn show(firmware: &Path, write_digest: bool) -> Result<()> {
    let (_, info) = image::load(firmware)?;
    let d = &info.descriptor;
    println!("{}", firmware.display().to_string().bold());
    println!("   project     {}", d.project_name);
    println!("   version     {}", d.version);
    println!("   built       {} {}", d.date, d.time);
    println!("   idf         {}", d.idf_version);
    println!("   secure ver  {}", d.secure_version);
    println!("   elf sha256  {}", image::hex(&d.elf_sha256));
    println!("   size        {} bytes", info.size);
    println!("   sha256      {}", image::hex(&info.sha256));
    if write_digest {
        let path = image::write_digest(firmware, &info)?;
        println!("{} wrote {}", "✅".green(), path.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Upload { host, firmware, port } => upload(host, *port, firmware),
        Command::Config { host, file, port } => push_config(host, *port, file),
        Command::Inspect { firmware, write_digest } => show(firmware, *write_digest),
    };
    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_omits_default_port() {
        assert_eq!(base_url("192.168.4.1", 80), "http://192.168.4.1");
        assert_eq!(base_url("station.local", 8080), "http://station.local:8080");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["station", "inspect", "fw.bin", "--write-digest"]).unwrap();
        assert!(matches!(cli.command, Command::Inspect { write_digest: true, .. }));
        let cli = Cli::try_parse_from(["station", "upload", "10.0.0.7", "fw.bin", "-p", "8080"]).unwrap();
        assert!(matches!(cli.command, Command::Upload { port: 8080, .. }));
    }
}
