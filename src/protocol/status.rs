//! Operational status view
//!
//! Typed access to the trailing fields of a successful
//! `ConsultarStatusOperacional` response.

use chrono::{NaiveDate, NaiveDateTime};

use super::datetime::{parse_date, parse_datetime};
use super::{CommandKind, CommandResponse};
use crate::error::{Result, SatError};

/// `ESTADO_OPERACAO` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Unblocked,
    BlockedBySefaz,
    BlockedByTaxpayer,
    BlockedAutonomously,
    BlockedForDeactivation,
    /// A value outside the status table
    Unknown(u8),
}

impl OperationState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OperationState::Unblocked,
            1 => OperationState::BlockedBySefaz,
            2 => OperationState::BlockedByTaxpayer,
            3 => OperationState::BlockedAutonomously,
            4 => OperationState::BlockedForDeactivation,
            other => OperationState::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            OperationState::Unblocked => 0,
            OperationState::BlockedBySefaz => 1,
            OperationState::BlockedByTaxpayer => 2,
            OperationState::BlockedAutonomously => 3,
            OperationState::BlockedForDeactivation => 4,
            OperationState::Unknown(code) => code,
        }
    }

    pub fn is_blocked(self) -> bool {
        self != OperationState::Unblocked
    }
}

/// Operational status reported by the SAT
///
/// Device times are local and carry no zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationalStatus {
    pub serial_number: String,
    pub lan_type: String,
    pub lan_ip: String,
    pub lan_mac: String,
    pub lan_mask: String,
    pub lan_gateway: String,
    pub lan_dns_1: String,
    pub lan_dns_2: String,
    pub lan_status: String,
    pub battery_level: String,
    pub memory_total: String,
    pub memory_used: String,
    pub current_time: NaiveDateTime,
    pub software_version: String,
    pub layout_version: String,
    pub last_cfe: String,
    pub pending_first: String,
    pub pending_last: String,
    /// `None` when no CF-e was ever transmitted
    pub last_cfe_transmission: Option<NaiveDateTime>,
    pub last_sefaz_contact: NaiveDateTime,
    pub certificate_issued: NaiveDate,
    pub certificate_expires: NaiveDate,
    pub state: OperationState,
}

impl OperationalStatus {
    /// Extract the status fields from a `10000` response
    pub fn from_response(response: &CommandResponse) -> Result<Self> {
        if response.command != CommandKind::QueryOperationalStatus {
            return Err(SatError::MalformedResponse(format!(
                "{} response carries no operational status",
                response.command
            )));
        }

        let field = |name: &str| -> Result<String> {
            response
                .field(name)
                .map(|value| value.trim().to_string())
                .ok_or_else(|| {
                    SatError::MalformedResponse(format!(
                        "operational status without {} (status {})",
                        name, response.status
                    ))
                })
        };

        let state_field = field("ESTADO_OPERACAO")?;
        let state = state_field
            .parse::<u8>()
            .map(OperationState::from_code)
            .map_err(|_| {
                SatError::MalformedResponse(format!("invalid ESTADO_OPERACAO {:?}", state_field))
            })?;

        let last_cfe_transmission = match field("DH_CFE")? {
            dh if is_blank(&dh) => None,
            dh => Some(parse_datetime("DH_CFE", &dh)?),
        };

        Ok(Self {
            serial_number: field("NSERIE")?,
            lan_type: field("TIPO_LAN")?,
            lan_ip: normalize_ip(&field("LAN_IP")?),
            lan_mac: field("LAN_MAC")?,
            lan_mask: normalize_ip(&field("LAN_MASK")?),
            lan_gateway: normalize_ip(&field("LAN_GW")?),
            lan_dns_1: normalize_ip(&field("LAN_DNS_1")?),
            lan_dns_2: normalize_ip(&field("LAN_DNS_2")?),
            lan_status: field("STATUS_LAN")?,
            battery_level: field("NIVEL_BATERIA")?,
            memory_total: field("MT_TOTAL")?,
            memory_used: field("MT_USADA")?,
            current_time: parse_datetime("DH_ATUAL", &field("DH_ATUAL")?)?,
            software_version: field("VER_SB")?,
            layout_version: field("VER_LAYOUT")?,
            last_cfe: field("ULTIMO_CF_E_SAT")?,
            pending_first: field("LISTA_INICIAL")?,
            pending_last: field("LISTA_FINAL")?,
            last_cfe_transmission,
            last_sefaz_contact: parse_datetime("DH_ULTIMA", &field("DH_ULTIMA")?)?,
            certificate_issued: parse_date("CERT_EMISSAO", &field("CERT_EMISSAO")?)?,
            certificate_expires: parse_date("CERT_VENCIMENTO", &field("CERT_VENCIMENTO")?)?,
            state,
        })
    }

    /// Documents are waiting to be transmitted to SEFAZ
    ///
    /// Both pending list bounds blank or all zeros means nothing is pending.
    pub fn has_pending_documents(&self) -> bool {
        !(is_blank(&self.pending_first) && is_blank(&self.pending_last))
    }

    /// Number of CF-e waiting for SEFAZ, from the pending list bounds
    ///
    /// `Some(0)` when nothing is pending, `None` when a bound is not a
    /// CF-e access key.
    pub fn pending_documents(&self) -> Option<u32> {
        if !self.has_pending_documents() {
            return Some(0);
        }
        let first = document_number(&self.pending_first)?;
        let last = document_number(&self.pending_last)?;
        Some(first.abs_diff(last) + 1)
    }
}

/// `nCF` of a 44-digit access key, with or without the `CFe` prefix
///
/// ```text
/// cUF(2) AAMM(4) CNPJ(14) mod(2) nserieSAT(9) nCF(6) cNF(6) DV(1)
/// ```
fn document_number(key: &str) -> Option<u32> {
    let key = key.trim();
    let digits = key.strip_prefix("CFe").unwrap_or(key);
    if digits.len() != 44 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits[31..37].parse().ok()
}

fn is_blank(value: &str) -> bool {
    value.trim().trim_matches('0').is_empty()
}

/// Devices pad IPv4 octets with zeros (`010.000.000.001`)
fn normalize_ip(value: &str) -> String {
    let octets: Vec<&str> = value.split('.').collect();
    if octets.len() != 4 {
        return value.to_string();
    }
    let parsed: Option<Vec<String>> = octets
        .iter()
        .map(|octet| octet.parse::<u8>().ok().map(|n| n.to_string()))
        .collect();
    parsed.map_or_else(|| value.to_string(), |octets| octets.join("."))
}
