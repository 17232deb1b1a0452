// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tpm2::{sweep, SweepScope, TpmAlgId, TpmContext, TpmError};
use tpm_seal::error::{read_input, write_output};
use tpm_seal::negotiator::{Encryption, HmacMode, SessionPlan};
use tpm_seal::{classify, eventlog, flows, import, keys, pcr_spec, report, ImportBlob};
use tracing::info;

/// Policy-gated TPM sealing utility
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TPM to talk to: a device path, `simulator`, or a host:port to dial
    #[arg(long, global = true, default_value = "/dev/tpmrm0")]
    tpm_path: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal "secrets" to a PCR's live value, then load and unseal it
    SealUnseal(SealUnsealArgs),
    /// Seal behind an auth value and unseal over an HMAC session
    EncryptedSession(EncryptedSessionArgs),
    /// Export the endorsement public key as PEM
    EkPub(EkPubArgs),
    /// Wrap a secret for another TPM's endorsement key
    ImportSeal(ImportSealArgs),
    /// Import and unseal a wrapped secret on this TPM
    ImportUnseal(ImportUnsealArgs),
    /// Verify the firmware event log against PCR values
    EventLog(EventLogArgs),
    /// Flush leftover handles
    Flush(FlushArgs),
}

#[derive(Parser)]
struct SealUnsealArgs {
    /// PCR (SHA-256 bank) the secret is sealed to
    #[arg(long, default_value = "23")]
    pcr: String,
}

#[derive(Parser)]
struct EncryptedSessionArgs {
    /// data to seal
    #[arg(long, default_value = "secrets")]
    data: String,

    /// how the unseal session is keyed: plain, salted-ek, salted-primary or bound
    #[arg(long)]
    session_mode: String,

    /// parameter encryption of the unseal session: none, in, out or in-out
    #[arg(long, default_value = "out")]
    encrypt: String,
}

#[derive(Parser)]
struct EkPubArgs {
    /// write the PEM here instead of stdout
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Parser)]
struct ImportSealArgs {
    /// PEM public key of the target's endorsement key
    #[arg(long)]
    ek_pub_file: PathBuf,

    /// where to write the wrapped blob
    #[arg(long)]
    sealed_data_file: PathBuf,

    /// secret to wrap
    #[arg(long)]
    secret: String,

    /// SHA-256 PCR values the target must hold, as index=hex,...
    #[arg(long)]
    pcr_values: Option<String>,
}

#[derive(Parser)]
struct ImportUnsealArgs {
    /// wrapped blob written by import-seal
    #[arg(long)]
    sealed_data_file: PathBuf,

    /// sweep handles of this scope before importing
    #[arg(long)]
    flush: Option<String>,
}

#[derive(Parser)]
struct EventLogArgs {
    /// binary event log; defaults to /sys/kernel/security/tpm0/binary_bios_measurements
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// PCR to verify
    #[arg(long)]
    pcr: String,

    /// expected PCR value in hex instead of reading it from the TPM
    #[arg(long)]
    pcr_value: Option<String>,

    /// PCR bank: sha1 or sha256
    #[arg(long, default_value = "sha1")]
    bank: String,
}

#[derive(Parser)]
struct FlushArgs {
    /// all, loaded, saved or transient
    #[arg(long, default_value = "all")]
    scope: String,
}

fn open_tpm(path: &str) -> Result<TpmContext> {
    TpmContext::new(Some(path)).with_context(|| format!("failed to open TPM at {path}"))
}

fn cmd_seal_unseal(tpm_path: &str, args: SealUnsealArgs) -> Result<()> {
    let pcr = pcr_spec::parse_pcr_index(&args.pcr)?;
    let mut ctx = open_tpm(tpm_path)?;
    let data = flows::seal_unseal(&mut ctx, pcr, flows::SEAL_UNSEAL_PAYLOAD)?;
    ctx.close();
    println!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

fn cmd_encrypted_session(tpm_path: &str, args: EncryptedSessionArgs) -> Result<()> {
    let mode: HmacMode = args.session_mode.parse()?;
    let Encryption(encryption) = args.encrypt.parse::<Encryption>()?;
    let mut ctx = open_tpm(tpm_path)?;
    let data = flows::encrypted_session(
        &mut ctx,
        args.data.as_bytes(),
        SessionPlan::new(mode, encryption),
    )?;
    ctx.close();
    println!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

fn cmd_ek_pub(tpm_path: &str, args: EkPubArgs) -> Result<()> {
    let mut ctx = open_tpm(tpm_path)?;
    let pem = flows::ek_public_pem(&mut ctx)?;
    ctx.close();
    match args.out {
        Some(path) => {
            write_output(&path, "EK public key", &pem)?;
            info!("EK public key written to {}", path.display());
        }
        None => print!("{pem}"),
    }
    Ok(())
}

fn cmd_import_seal(args: ImportSealArgs) -> Result<()> {
    let pcrs = args
        .pcr_values
        .as_deref()
        .map(|spec| pcr_spec::parse_pcr_values(spec, TpmAlgId::Sha256))
        .transpose()?;
    let pem = read_input(&args.ek_pub_file, "EK public key")?;
    let pem = String::from_utf8(pem)
        .map_err(|_| TpmError::malformed("EK public key file is not text"))?;
    let ek_public = keys::ek_public_from_pem(&pem)?;
    let blob = import::wrap(
        &ek_public,
        args.secret.as_bytes(),
        pcrs.as_ref(),
        &mut rand::thread_rng(),
    )?;
    blob.write_to(&args.sealed_data_file)?;
    info!("wrapped secret written to {}", args.sealed_data_file.display());
    Ok(())
}

fn cmd_import_unseal(tpm_path: &str, args: ImportUnsealArgs) -> Result<()> {
    let flush = args
        .flush
        .as_deref()
        .map(str::parse::<SweepScope>)
        .transpose()?;
    let blob = ImportBlob::read_from(&args.sealed_data_file)?;
    let mut ctx = open_tpm(tpm_path)?;
    if let Some(scope) = flush {
        sweep(&mut ctx, scope)?;
    }
    let secret = flows::import_unseal(&mut ctx, &blob)?;
    ctx.close();
    println!("{}", String::from_utf8_lossy(&secret));
    Ok(())
}

fn cmd_event_log(tpm_path: &str, args: EventLogArgs) -> Result<()> {
    let pcr = pcr_spec::parse_pcr_index(&args.pcr)?;
    let bank = pcr_spec::parse_bank(&args.bank)?;
    let given = args
        .pcr_value
        .as_deref()
        .map(|value| {
            hex::decode(value.trim()).map_err(|e| {
                TpmError::malformed(format!("PCR value is not valid hex: {e}"))
            })
        })
        .transpose()?;
    let log = eventlog::read_log(args.event_log.as_deref())?;
    let reference = match given {
        Some(value) => eventlog::given_bank(bank, pcr, value)?,
        None => {
            let mut ctx = open_tpm(tpm_path)?;
            let reference = eventlog::live_bank(&mut ctx, bank, &[pcr])?;
            ctx.close();
            reference
        }
    };
    let verified = eventlog::verify_log(&log, &reference)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&verified).context("failed to serialize events")?
    );
    Ok(())
}

fn cmd_flush(tpm_path: &str, args: FlushArgs) -> Result<()> {
    let scope: SweepScope = args.scope.parse()?;
    let mut ctx = open_tpm(tpm_path)?;
    let flushed = sweep(&mut ctx, scope)?;
    ctx.close();
    println!("flushed {flushed} handle(s)");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let tpm_path = cli.tpm_path.as_str();
    match cli.command {
        Commands::SealUnseal(args) => cmd_seal_unseal(tpm_path, args)?,
        Commands::EncryptedSession(args) => cmd_encrypted_session(tpm_path, args)?,
        Commands::EkPub(args) => cmd_ek_pub(tpm_path, args)?,
        Commands::ImportSeal(args) => cmd_import_seal(args)?,
        Commands::ImportUnseal(args) => cmd_import_unseal(tpm_path, args)?,
        Commands::EventLog(args) => cmd_event_log(tpm_path, args)?,
        Commands::Flush(args) => cmd_flush(tpm_path, args)?,
    }
    Ok(())
}

fn main() {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{}", report(&err));
        std::process::exit(classify(&err).exit_code());
    }
}
