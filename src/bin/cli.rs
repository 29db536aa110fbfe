//! SAT CLI
//!
//! Runs SAT functions against the built-in mockup device.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use satcfe::exchange::FileCertificate;
use satcfe::protocol::{ActivationCodeOption, CertificateKind, CommandResponse};
use satcfe::transport::{MockupConfig, MockupDevice, MockupTransport};
use satcfe::{AlertRegistry, CommandExecutor, Config, ExecutionError, SatClient, SessionNumber};
use tracing_subscriber::{fmt, EnvFilter};

/// SAT CLI
#[derive(Parser, Debug)]
#[command(name = "sat-cli")]
#[command(about = "Drive SAT-CF-e functions against a mockup device")]
#[command(version)]
struct Args {
    /// Activation code configured on the device
    #[arg(short, long, default_value = "12345678")]
    activation_code: String,

    /// Session journal file
    #[arg(short, long)]
    journal: Option<PathBuf>,

    /// Device clock (AAAAMMDDhhmmss)
    #[arg(long, default_value = "20260101120000")]
    clock: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// ConsultarSAT
    QuerySat,

    /// ConsultarStatusOperacional
    Status,

    /// Operational status checked for pending CF-e, certificate expiry and
    /// clock divergence
    Alerts,

    /// AtivarSAT
    Activate {
        cnpj: String,

        /// IBGE code of the state
        uf: u8,

        /// Generate an ICP-Brasil CSR instead
        #[arg(long)]
        icp: bool,
    },

    /// ComunicarCertificadoICPBRASIL
    Certificate {
        /// File holding the certificate
        file: PathBuf,
    },

    /// EnviarDadosVenda
    Sale {
        /// Sale XML
        data: String,
    },

    /// EnviarDadosVenda followed by CancelarUltimaVenda
    SaleAndCancel {
        data: String,
        cancellation: String,
    },

    /// TesteFimAFim
    EndToEnd { data: String },

    /// ConsultarNumeroSessao
    QuerySession { session: u32 },

    /// ConfigurarInterfaceDeRede
    Network { configuration: String },

    /// AssociarAssinatura
    Associate { cnpj_sequence: String, signature: String },

    /// AtualizarSoftwareSAT
    UpdateSoftware,

    /// ExtrairLogs
    Logs,

    /// BloquearSAT
    Block,

    /// DesbloquearSAT
    Unblock,

    /// TrocarCodigoDeAtivacao
    ChangeCode {
        new_code: String,
        confirmation: String,

        /// Authorise with the emergency code
        #[arg(long)]
        emergency: Option<String>,
    },

    /// ConsultarUltimaSessaoFiscal
    LastFiscal,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,satcfe=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("sat-cli v{}", satcfe::VERSION);

    let (_device, transport) = match MockupDevice::spawn(MockupConfig {
        activation_code: args.activation_code.clone(),
        clock: args.clock.clone(),
        ..MockupConfig::default()
    }) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("Failed to start mockup device: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut builder = Config::builder().activation_code(&args.activation_code);
    if let Some(path) = &args.journal {
        builder = builder.journal_path(path);
    }

    let client = match CommandExecutor::open(transport, builder.build()) {
        Ok(executor) => SatClient::new(executor),
        Err(e) => {
            tracing::error!("Failed to open executor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&client, args.command) {
        Ok(responses) => {
            for response in &responses {
                print_response(response);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(response) = e.response() {
                print_response(response);
            }
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    client: &SatClient<MockupTransport>,
    command: Commands,
) -> Result<Vec<CommandResponse>, ExecutionError> {
    let response = match command {
        Commands::QuerySat => client.query_sat()?,
        Commands::Status => {
            let status = client.query_operational_status()?;
            println!("{:#?}", status);
            return Ok(Vec::new());
        }
        Commands::Alerts => {
            let alerts = client.check_alerts(&AlertRegistry::default())?;
            if alerts.is_empty() {
                println!("No active alerts");
            }
            for alert in &alerts {
                println!("[{}] {}", alert.check, alert.message);
            }
            return Ok(Vec::new());
        }
        Commands::Activate { cnpj, uf, icp } => {
            let kind = if icp {
                CertificateKind::IcpBrasil
            } else {
                CertificateKind::AcSatSefaz
            };
            let code = client.activation_code().unwrap_or_default();
            client.activate(kind, &code, &cnpj, uf)?
        }
        Commands::Certificate { file } => {
            client.communicate_certificate(&FileCertificate::new(file))?
        }
        Commands::Sale { data } => client.send_sale(&data)?,
        Commands::SaleAndCancel { data, cancellation } => {
            let sale = client.send_sale(&data)?;
            let key = sale.field("chaveConsulta").unwrap_or_default().to_string();
            let cancel = client.cancel_last_sale(&key, &cancellation)?;
            return Ok(vec![sale, cancel]);
        }
        Commands::EndToEnd { data } => client.end_to_end_test(&data)?,
        Commands::QuerySession { session } => {
            let target = SessionNumber::new(session).ok_or_else(|| {
                satcfe::SatError::Config(format!("session {} out of range", session))
            })?;
            client.query_session_number(target)?
        }
        Commands::Network { configuration } => client.configure_network(&configuration)?,
        Commands::Associate {
            cnpj_sequence,
            signature,
        } => client.associate_signature(&cnpj_sequence, &signature)?,
        Commands::UpdateSoftware => client.update_software()?,
        Commands::Logs => client.extract_logs()?,
        Commands::Block => client.block()?,
        Commands::Unblock => client.unblock()?,
        Commands::ChangeCode {
            new_code,
            confirmation,
            emergency,
        } => {
            let (option, current) = match emergency {
                Some(code) => (ActivationCodeOption::Emergency, code),
                None => (
                    ActivationCodeOption::Regular,
                    client.activation_code().unwrap_or_default(),
                ),
            };
            client.change_activation_code(option, &current, &new_code, &confirmation)?
        }
        Commands::LastFiscal => client.query_last_fiscal_session()?,
    };
    Ok(vec![response])
}

fn print_response(response: &CommandResponse) {
    println!(
        "{} session={} status={} message={:?}",
        response.command, response.session, response.status, response.message
    );
    if let Some(alert) = &response.alert_code {
        println!("  CCCC = {}", alert);
    }
    if let Some(sefaz) = &response.sefaz {
        println!("  SEFAZ {} {:?}", sefaz.code, sefaz.message);
    }
    for (name, value) in &response.fields {
        println!("  {} = {}", name, value);
    }
}
