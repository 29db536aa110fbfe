//! Command definitions
//!
//! Represents commands sent by the commercial application to the SAT.

use serde::{Deserialize, Serialize};

use crate::session::SessionNumber;

/// Command kinds, one per SAT library function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    Activate,
    CommunicateCertificate,
    SendSaleData,
    CancelLastSale,
    QuerySat,
    EndToEndTest,
    QueryOperationalStatus,
    QuerySessionNumber,
    ConfigureNetwork,
    AssociateSignature,
    UpdateSoftware,
    ExtractLogs,
    Block,
    Unblock,
    ChangeActivationCode,
    QueryLastFiscalSession,
}

impl CommandKind {
    /// Every command kind, in status family order
    pub const ALL: [CommandKind; 16] = [
        CommandKind::Activate,
        CommandKind::CommunicateCertificate,
        CommandKind::SendSaleData,
        CommandKind::CancelLastSale,
        CommandKind::QuerySat,
        CommandKind::EndToEndTest,
        CommandKind::QueryOperationalStatus,
        CommandKind::QuerySessionNumber,
        CommandKind::ConfigureNetwork,
        CommandKind::AssociateSignature,
        CommandKind::UpdateSoftware,
        CommandKind::ExtractLogs,
        CommandKind::Block,
        CommandKind::Unblock,
        CommandKind::ChangeActivationCode,
        CommandKind::QueryLastFiscalSession,
    ];

    /// Name of the function in the SAT library, used as the first wire field
    pub fn function_name(self) -> &'static str {
        match self {
            CommandKind::Activate => "AtivarSAT",
            CommandKind::CommunicateCertificate => "ComunicarCertificadoICPBRASIL",
            CommandKind::SendSaleData => "EnviarDadosVenda",
            CommandKind::CancelLastSale => "CancelarUltimaVenda",
            CommandKind::QuerySat => "ConsultarSAT",
            CommandKind::EndToEndTest => "TesteFimAFim",
            CommandKind::QueryOperationalStatus => "ConsultarStatusOperacional",
            CommandKind::QuerySessionNumber => "ConsultarNumeroSessao",
            CommandKind::ConfigureNetwork => "ConfigurarInterfaceDeRede",
            CommandKind::AssociateSignature => "AssociarAssinatura",
            CommandKind::UpdateSoftware => "AtualizarSoftwareSAT",
            CommandKind::ExtractLogs => "ExtrairLogs",
            CommandKind::Block => "BloquearSAT",
            CommandKind::Unblock => "DesbloquearSAT",
            CommandKind::ChangeActivationCode => "TrocarCodigoDeAtivacao",
            CommandKind::QueryLastFiscalSession => "ConsultarUltimaSessaoFiscal",
        }
    }

    /// Look a kind up by its library function name
    pub fn from_function_name(name: &str) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| kind.function_name() == name)
    }

    /// Two leading digits of every status code this command answers with
    ///
    /// `EEEEE` codes are grouped per function: `06xxx` for EnviarDadosVenda,
    /// `08xxx` for ConsultarSAT and so on. Family `01`..`03` is unused.
    pub fn family(self) -> u8 {
        match self {
            CommandKind::Activate => 4,
            CommandKind::CommunicateCertificate => 5,
            CommandKind::SendSaleData => 6,
            CommandKind::CancelLastSale => 7,
            CommandKind::QuerySat => 8,
            CommandKind::EndToEndTest => 9,
            CommandKind::QueryOperationalStatus => 10,
            CommandKind::QuerySessionNumber => 11,
            CommandKind::ConfigureNetwork => 12,
            CommandKind::AssociateSignature => 13,
            CommandKind::UpdateSoftware => 14,
            CommandKind::ExtractLogs => 15,
            CommandKind::Block => 16,
            CommandKind::Unblock => 17,
            CommandKind::ChangeActivationCode => 18,
            CommandKind::QueryLastFiscalSession => 19,
        }
    }

    /// Reverse of [`CommandKind::family`]
    pub fn from_family(family: u8) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| kind.family() == family)
    }

    /// Queries the device can answer any number of times without side effects
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            CommandKind::QuerySat
                | CommandKind::QueryOperationalStatus
                | CommandKind::QuerySessionNumber
                | CommandKind::QueryLastFiscalSession
                | CommandKind::ExtractLogs
        )
    }

    /// Re-query commands may carry another command's response
    pub fn is_requery(self) -> bool {
        matches!(
            self,
            CommandKind::QuerySessionNumber | CommandKind::QueryLastFiscalSession
        )
    }

    /// ConsultarSAT is the only function called without an activation code
    pub fn requires_activation_code(self) -> bool {
        self != CommandKind::QuerySat
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.function_name())
    }
}

/// `subComando` argument of AtivarSAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertificateKind {
    AcSatSefaz = 1,
    IcpBrasil = 2,
    IcpBrasilRenewal = 3,
}

impl CertificateKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(CertificateKind::AcSatSefaz),
            2 => Some(CertificateKind::IcpBrasil),
            3 => Some(CertificateKind::IcpBrasilRenewal),
            _ => None,
        }
    }
}

/// `opcao` argument of TrocarCodigoDeAtivacao
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationCodeOption {
    /// Replace the regular activation code
    Regular = 1,
    /// Replace using the emergency code
    Emergency = 2,
}

impl ActivationCodeOption {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ActivationCodeOption::Regular),
            2 => Some(ActivationCodeOption::Emergency),
            _ => None,
        }
    }
}

/// Command-specific arguments
///
/// Text blobs (sale XML, certificates, network configuration) are opaque at
/// this layer and travel verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Activate {
        certificate_kind: CertificateKind,
        cnpj: String,
        uf_code: u8,
    },
    CommunicateCertificate {
        certificate: String,
    },
    SendSaleData {
        sale_data: String,
    },
    CancelLastSale {
        cfe_key: String,
        cancellation_data: String,
    },
    QuerySat,
    EndToEndTest {
        sale_data: String,
    },
    QueryOperationalStatus,
    QuerySessionNumber {
        target: SessionNumber,
    },
    ConfigureNetwork {
        configuration: String,
    },
    AssociateSignature {
        cnpj_sequence: String,
        signature: String,
    },
    UpdateSoftware,
    ExtractLogs,
    Block,
    Unblock,
    ChangeActivationCode {
        option: ActivationCodeOption,
        new_code: String,
        confirmation: String,
    },
    QueryLastFiscalSession,
}

impl CommandPayload {
    /// Get the command kind
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::Activate { .. } => CommandKind::Activate,
            CommandPayload::CommunicateCertificate { .. } => CommandKind::CommunicateCertificate,
            CommandPayload::SendSaleData { .. } => CommandKind::SendSaleData,
            CommandPayload::CancelLastSale { .. } => CommandKind::CancelLastSale,
            CommandPayload::QuerySat => CommandKind::QuerySat,
            CommandPayload::EndToEndTest { .. } => CommandKind::EndToEndTest,
            CommandPayload::QueryOperationalStatus => CommandKind::QueryOperationalStatus,
            CommandPayload::QuerySessionNumber { .. } => CommandKind::QuerySessionNumber,
            CommandPayload::ConfigureNetwork { .. } => CommandKind::ConfigureNetwork,
            CommandPayload::AssociateSignature { .. } => CommandKind::AssociateSignature,
            CommandPayload::UpdateSoftware => CommandKind::UpdateSoftware,
            CommandPayload::ExtractLogs => CommandKind::ExtractLogs,
            CommandPayload::Block => CommandKind::Block,
            CommandPayload::Unblock => CommandKind::Unblock,
            CommandPayload::ChangeActivationCode { .. } => CommandKind::ChangeActivationCode,
            CommandPayload::QueryLastFiscalSession => CommandKind::QueryLastFiscalSession,
        }
    }
}

/// A command addressed to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub session: SessionNumber,

    /// Activation code configured on the device; every function but
    /// ConsultarSAT requires it
    pub activation_code: Option<String>,

    pub payload: CommandPayload,
}

impl CommandRequest {
    pub fn new(
        session: SessionNumber,
        activation_code: Option<String>,
        payload: CommandPayload,
    ) -> Self {
        Self {
            session,
            activation_code,
            payload,
        }
    }

    /// Get the command kind
    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    /// Same command addressed to another session (used for retries)
    pub fn with_session(&self, session: SessionNumber) -> Self {
        Self {
            session,
            activation_code: self.activation_code.clone(),
            payload: self.payload.clone(),
        }
    }
}
