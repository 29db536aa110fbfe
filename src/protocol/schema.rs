//! Response layouts
//!
//! Every response starts with `numeroSessao|EEEEE`, optionally followed by the
//! `CCCC` alert code, then `mensagem|cod|mensagemSEFAZ` and finally the
//! command-specific trailing fields. A command may answer with more than one
//! layout (eg. a failed sale drops the trailing fields), and the layouts of a
//! single command always differ in field count, so the count alone selects
//! the layout.

use super::CommandKind;

/// Fields shared by every layout: session, status, message, cod, mensagemSEFAZ
pub const BASE_FIELDS: usize = 5;

/// One accepted response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// `CCCC` follows the status field
    pub has_alert_code: bool,

    /// Names of the fields after `mensagemSEFAZ`
    pub trailing: &'static [&'static str],
}

impl Layout {
    /// Total number of `|`-separated fields
    pub const fn field_count(&self) -> usize {
        BASE_FIELDS + self.has_alert_code as usize + self.trailing.len()
    }
}

pub const STANDARD: Layout = Layout {
    has_alert_code: false,
    trailing: &[],
};

pub const WITH_ALERT_CODE: Layout = Layout {
    has_alert_code: true,
    trailing: &[],
};

pub const ACTIVATE: Layout = Layout {
    has_alert_code: false,
    trailing: &["CSR"],
};

pub const SALE: Layout = Layout {
    has_alert_code: true,
    trailing: &[
        "arquivoCFeSAT",
        "timeStamp",
        "chaveConsulta",
        "valorTotalCFe",
        "CPFCNPJValue",
        "assinaturaQRCODE",
    ],
};

pub const CANCELLATION: Layout = Layout {
    has_alert_code: true,
    trailing: &[
        "arquivoCFeBase64",
        "timeStamp",
        "chaveConsulta",
        "valorTotalCFe",
        "CPFCNPJValue",
        "assinaturaQRCODE",
    ],
};

pub const END_TO_END: Layout = Layout {
    has_alert_code: false,
    trailing: &["arquivoCFeBase64", "timeStamp", "numDocFiscal", "chaveConsulta"],
};

pub const OPERATIONAL_STATUS: Layout = Layout {
    has_alert_code: false,
    trailing: &[
        "NSERIE",
        "TIPO_LAN",
        "LAN_IP",
        "LAN_MAC",
        "LAN_MASK",
        "LAN_GW",
        "LAN_DNS_1",
        "LAN_DNS_2",
        "STATUS_LAN",
        "NIVEL_BATERIA",
        "MT_TOTAL",
        "MT_USADA",
        "DH_ATUAL",
        "VER_SB",
        "VER_LAYOUT",
        "ULTIMO_CF_E_SAT",
        "LISTA_INICIAL",
        "LISTA_FINAL",
        "DH_CFE",
        "DH_ULTIMA",
        "CERT_EMISSAO",
        "CERT_VENCIMENTO",
        "ESTADO_OPERACAO",
    ],
};

pub const LOGS: Layout = Layout {
    has_alert_code: false,
    trailing: &["arquivoLog"],
};

/// Accepted layouts for a command, success layout first
pub fn layouts(kind: CommandKind) -> &'static [Layout] {
    match kind {
        CommandKind::Activate => &[ACTIVATE, STANDARD],
        CommandKind::SendSaleData => &[SALE, WITH_ALERT_CODE, STANDARD],
        CommandKind::CancelLastSale => &[CANCELLATION, WITH_ALERT_CODE, STANDARD],
        CommandKind::EndToEndTest => &[END_TO_END, STANDARD],
        CommandKind::QueryOperationalStatus => &[OPERATIONAL_STATUS, STANDARD],
        CommandKind::AssociateSignature => &[WITH_ALERT_CODE, STANDARD],
        CommandKind::ExtractLogs => &[LOGS, STANDARD],
        CommandKind::CommunicateCertificate
        | CommandKind::QuerySat
        | CommandKind::QuerySessionNumber
        | CommandKind::ConfigureNetwork
        | CommandKind::UpdateSoftware
        | CommandKind::Block
        | CommandKind::Unblock
        | CommandKind::ChangeActivationCode
        | CommandKind::QueryLastFiscalSession => &[STANDARD],
    }
}

/// Layout of a command with exactly `count` fields
pub fn layout_for(kind: CommandKind, count: usize) -> Option<&'static Layout> {
    layouts(kind).iter().find(|layout| layout.field_count() == count)
}

/// Smallest accepted field count for a command
pub fn min_fields(kind: CommandKind) -> usize {
    layouts(kind)
        .iter()
        .map(Layout::field_count)
        .min()
        .unwrap_or(BASE_FIELDS)
}
