//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Request Line
//! ```text
//! FunctionName|numeroSessao|arg1|arg2|...
//! ```
//! Arguments follow the order of the SAT library function signature, eg.
//! `AtivarSAT|000042|1|123456789|08427847000169|35`.
//!
//! ### Response Line
//! ```text
//! numeroSessao|EEEEE[|CCCC]|mensagem|cod|mensagemSEFAZ[|trailing...]
//! ```
//! See [`super::schema`] for the accepted layouts per command.
//!
//! There is no escaping: a field containing `|` cannot be represented and
//! is refused by the encoder.

use bytes::{BufMut, Bytes, BytesMut};

use super::schema::{self, Layout};
use super::{
    ActivationCodeOption, CertificateKind, CommandKind, CommandPayload, CommandRequest,
    CommandResponse, SefazReply, StatusCode,
};
use crate::error::{Result, SatError};
use crate::session::SessionNumber;

/// Field separator
pub const SEPARATOR: u8 = b'|';

/// Framing bytes a device may leave at the end of a line
const TRAILING_FRAMING: &[u8] = b"\r\n\0";

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

/// Encode a request into its wire line
pub fn encode_request(request: &CommandRequest) -> Result<Bytes> {
    let kind = request.kind();
    let mut line = LineWriter::new();
    line.push(kind.function_name());
    line.push(&request.session.to_string());

    let code = if kind.requires_activation_code() {
        match request.activation_code.as_deref() {
            Some(code) if !code.is_empty() => Some(code),
            _ => {
                return Err(SatError::Encoding(format!(
                    "{}: activation code is required",
                    kind
                )))
            }
        }
    } else {
        None
    };
    // Present for every kind except ConsultarSAT, checked above
    let code = code.unwrap_or_default();

    match &request.payload {
        CommandPayload::Activate {
            certificate_kind,
            cnpj,
            uf_code,
        } => {
            line.push(&(*certificate_kind as u8).to_string());
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "CNPJ", cnpj)?;
            line.push(&uf_code.to_string());
        }
        CommandPayload::CommunicateCertificate { certificate } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "certificado", certificate)?;
        }
        CommandPayload::SendSaleData { sale_data } | CommandPayload::EndToEndTest { sale_data } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "dadosVenda", sale_data)?;
        }
        CommandPayload::CancelLastSale {
            cfe_key,
            cancellation_data,
        } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "chave", cfe_key)?;
            line.text(kind, "dadosCancelamento", cancellation_data)?;
        }
        CommandPayload::QuerySat => {}
        CommandPayload::QuerySessionNumber { target } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.push(&target.to_string());
        }
        CommandPayload::ConfigureNetwork { configuration } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "dadosConfiguracao", configuration)?;
        }
        CommandPayload::AssociateSignature {
            cnpj_sequence,
            signature,
        } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.text(kind, "CNPJvalue", cnpj_sequence)?;
            line.text(kind, "assinaturaCNPJs", signature)?;
        }
        CommandPayload::ChangeActivationCode {
            option,
            new_code,
            confirmation,
        } => {
            line.text(kind, "codigoDeAtivacao", code)?;
            line.push(&(*option as u8).to_string());
            line.text(kind, "novoCodigo", new_code)?;
            line.text(kind, "confNovoCodigo", confirmation)?;
        }
        CommandPayload::QueryOperationalStatus
        | CommandPayload::UpdateSoftware
        | CommandPayload::ExtractLogs
        | CommandPayload::Block
        | CommandPayload::Unblock
        | CommandPayload::QueryLastFiscalSession => {
            line.text(kind, "codigoDeAtivacao", code)?;
        }
    }

    Ok(line.finish())
}

/// Decode a request line (device side)
pub fn decode_request(bytes: &[u8]) -> Result<CommandRequest> {
    let text = std::str::from_utf8(trim_framing(bytes))
        .map_err(|e| SatError::MalformedRequest(format!("not valid UTF-8: {}", e)))?;
    let parts: Vec<&str> = text.split('|').collect();

    let kind = CommandKind::from_function_name(parts[0]).ok_or_else(|| {
        SatError::MalformedRequest(format!("Unknown function: {:?}", parts[0]))
    })?;

    let expected = request_arity(kind);
    if parts.len() != expected {
        return Err(SatError::MalformedRequest(format!(
            "{}: expected {} fields, got {}",
            kind,
            expected,
            parts.len()
        )));
    }

    let session = SessionNumber::parse(parts[1]).ok_or_else(|| {
        SatError::MalformedRequest(format!("{}: invalid session {:?}", kind, parts[1]))
    })?;
    let args = &parts[2..];
    let owned = |index: usize| args[index].to_string();

    let (activation_code, payload) = match kind {
        CommandKind::Activate => {
            let certificate_kind = parse_number(kind, args[0])
                .and_then(|n| {
                    CertificateKind::from_code(n).ok_or_else(|| {
                        SatError::MalformedRequest(format!("{}: unknown subcommand {}", kind, n))
                    })
                })?;
            let uf_code = parse_number(kind, args[3]).and_then(|n| {
                u8::try_from(n).map_err(|_| {
                    SatError::MalformedRequest(format!("{}: UF code {} out of range", kind, n))
                })
            })?;
            (
                Some(owned(1)),
                CommandPayload::Activate {
                    certificate_kind,
                    cnpj: owned(2),
                    uf_code,
                },
            )
        }
        CommandKind::QuerySat => (None, CommandPayload::QuerySat),
        CommandKind::CommunicateCertificate => (
            Some(owned(0)),
            CommandPayload::CommunicateCertificate {
                certificate: owned(1),
            },
        ),
        CommandKind::SendSaleData => (
            Some(owned(0)),
            CommandPayload::SendSaleData {
                sale_data: owned(1),
            },
        ),
        CommandKind::EndToEndTest => (
            Some(owned(0)),
            CommandPayload::EndToEndTest {
                sale_data: owned(1),
            },
        ),
        CommandKind::CancelLastSale => (
            Some(owned(0)),
            CommandPayload::CancelLastSale {
                cfe_key: owned(1),
                cancellation_data: owned(2),
            },
        ),
        CommandKind::QuerySessionNumber => {
            let target = SessionNumber::parse(args[1]).ok_or_else(|| {
                SatError::MalformedRequest(format!("{}: invalid target {:?}", kind, args[1]))
            })?;
            (Some(owned(0)), CommandPayload::QuerySessionNumber { target })
        }
        CommandKind::ConfigureNetwork => (
            Some(owned(0)),
            CommandPayload::ConfigureNetwork {
                configuration: owned(1),
            },
        ),
        CommandKind::AssociateSignature => (
            Some(owned(0)),
            CommandPayload::AssociateSignature {
                cnpj_sequence: owned(1),
                signature: owned(2),
            },
        ),
        CommandKind::ChangeActivationCode => {
            let option = parse_number(kind, args[1]).and_then(|n| {
                ActivationCodeOption::from_code(n).ok_or_else(|| {
                    SatError::MalformedRequest(format!("{}: unknown option {}", kind, n))
                })
            })?;
            (
                Some(owned(0)),
                CommandPayload::ChangeActivationCode {
                    option,
                    new_code: owned(2),
                    confirmation: owned(3),
                },
            )
        }
        CommandKind::QueryOperationalStatus => {
            (Some(owned(0)), CommandPayload::QueryOperationalStatus)
        }
        CommandKind::UpdateSoftware => (Some(owned(0)), CommandPayload::UpdateSoftware),
        CommandKind::ExtractLogs => (Some(owned(0)), CommandPayload::ExtractLogs),
        CommandKind::Block => (Some(owned(0)), CommandPayload::Block),
        CommandKind::Unblock => (Some(owned(0)), CommandPayload::Unblock),
        CommandKind::QueryLastFiscalSession => {
            (Some(owned(0)), CommandPayload::QueryLastFiscalSession)
        }
    };

    Ok(CommandRequest::new(session, activation_code, payload))
}

/// Number of fields in a request line, function name included
fn request_arity(kind: CommandKind) -> usize {
    let args = match kind {
        CommandKind::QuerySat => 0,
        CommandKind::Activate => 4,
        CommandKind::ChangeActivationCode => 4,
        CommandKind::CancelLastSale | CommandKind::AssociateSignature => 3,
        CommandKind::CommunicateCertificate
        | CommandKind::SendSaleData
        | CommandKind::EndToEndTest
        | CommandKind::QuerySessionNumber
        | CommandKind::ConfigureNetwork => 2,
        CommandKind::QueryOperationalStatus
        | CommandKind::UpdateSoftware
        | CommandKind::ExtractLogs
        | CommandKind::Block
        | CommandKind::Unblock
        | CommandKind::QueryLastFiscalSession => 1,
    };
    2 + args
}

fn parse_number(kind: CommandKind, field: &str) -> Result<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SatError::MalformedRequest(format!(
            "{}: expected a number, got {:?}",
            kind, field
        )));
    }
    field
        .parse()
        .map_err(|_| SatError::MalformedRequest(format!("{}: number {:?} too large", kind, field)))
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response into its wire line (device side)
///
/// The response must match one of the layouts of its command.
pub fn encode_response(response: &CommandResponse) -> Result<Bytes> {
    let count = schema::BASE_FIELDS + response.alert_code.is_some() as usize + response.fields.len();
    let layout = schema::layout_for(response.command, count)
        .filter(|layout| layout_matches(layout, response))
        .ok_or_else(|| {
            SatError::Encoding(format!(
                "{}: response fields do not match any layout",
                response.command
            ))
        })?;

    let kind = response.command;
    let mut line = LineWriter::new();
    line.push(&response.session.to_string());
    line.push(&response.status.to_string());
    if let Some(alert) = &response.alert_code {
        line.field(kind, "CCCC", alert)?;
    }
    line.field(kind, "mensagem", &response.message)?;
    match &response.sefaz {
        Some(sefaz) => {
            line.field(kind, "cod", &sefaz.code)?;
            line.field(kind, "mensagemSEFAZ", &sefaz.message)?;
        }
        None => {
            line.push("");
            line.push("");
        }
    }
    for (name, (_, value)) in layout.trailing.iter().zip(&response.fields) {
        line.field(kind, name, value)?;
    }

    Ok(line.finish())
}

fn layout_matches(layout: &Layout, response: &CommandResponse) -> bool {
    layout.has_alert_code == response.alert_code.is_some()
        && layout
            .trailing
            .iter()
            .zip(&response.fields)
            .all(|(expected, (name, _))| expected == name)
}

/// Decode a response line for a command of kind `expected`
///
/// Never returns a partially populated response: either every field of a
/// known layout is present and well formed, or the whole line is rejected.
pub fn decode_response(bytes: &[u8], expected: CommandKind) -> Result<CommandResponse> {
    let text = std::str::from_utf8(trim_framing(bytes)).map_err(|e| SatError::EncodingNotUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;

    if !text.contains('|') {
        return Err(SatError::MalformedResponse(format!(
            "{}: no pipes separating the fields: {:?}",
            expected, text
        )));
    }

    let parts: Vec<&str> = text.split('|').collect();

    let session = SessionNumber::parse(parts[0]).ok_or_else(|| {
        SatError::MalformedResponse(format!("{}: invalid session field {:?}", expected, parts[0]))
    })?;
    let status = StatusCode::parse(parts[1]).ok_or_else(|| {
        SatError::MalformedResponse(format!("{}: invalid status field {:?}", expected, parts[1]))
    })?;

    let command = responding_command(expected, status)?;

    let layout = schema::layout_for(command, parts.len()).ok_or_else(|| {
        let accepted: Vec<String> = schema::layouts(command)
            .iter()
            .map(|layout| layout.field_count().to_string())
            .collect();
        SatError::MalformedResponse(format!(
            "{}: expected {} fields, got {}",
            command,
            accepted.join(" or "),
            parts.len()
        ))
    })?;

    let mut index = 2;
    let alert_code = if layout.has_alert_code {
        index += 1;
        Some(parts[2].to_string())
    } else {
        None
    };

    let message = parts[index].to_string();
    let (cod, sefaz_message) = (parts[index + 1], parts[index + 2]);
    let sefaz = if cod.is_empty() && sefaz_message.is_empty() {
        None
    } else {
        Some(SefazReply {
            code: cod.to_string(),
            message: sefaz_message.to_string(),
        })
    };

    let fields = layout
        .trailing
        .iter()
        .zip(&parts[index + 3..])
        .map(|(name, value)| (*name, value.to_string()))
        .collect();

    let mut response = CommandResponse::new(command, session, status, message);
    response.alert_code = alert_code;
    response.sefaz = sefaz;
    response.fields = fields;
    response.set_verbatim(text.to_string());
    Ok(response)
}

/// Session number of a response line, without decoding the rest
///
/// Lets a caller route a frame before knowing which layout it follows.
pub fn peek_session(bytes: &[u8]) -> Option<SessionNumber> {
    let line = trim_framing(bytes);
    let end = line.iter().position(|b| *b == SEPARATOR)?;
    std::str::from_utf8(&line[..end])
        .ok()
        .and_then(SessionNumber::parse)
}

/// Which command's layout a response follows
///
/// ConsultarNumeroSessao returns the stored response of whatever command ran
/// under the target session, so any other family is accepted there.
/// ConsultarUltimaSessaoFiscal only ever reports a sale or a cancellation.
/// Everything else must answer within its own family.
fn responding_command(expected: CommandKind, status: StatusCode) -> Result<CommandKind> {
    if status.family() == expected.family() {
        return Ok(expected);
    }

    let carried = match expected {
        CommandKind::QuerySessionNumber => {
            CommandKind::from_family(status.family()).filter(|kind| !kind.is_requery())
        }
        CommandKind::QueryLastFiscalSession => CommandKind::from_family(status.family())
            .filter(|kind| matches!(kind, CommandKind::SendSaleData | CommandKind::CancelLastSale)),
        _ => None,
    };

    carried.ok_or_else(|| {
        SatError::MalformedResponse(format!(
            "{}: status {} belongs to another command",
            expected, status
        ))
    })
}

// =============================================================================
// Line helpers
// =============================================================================

fn trim_framing(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !TRAILING_FRAMING.contains(b))
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

/// Builds a `|`-joined line
struct LineWriter {
    buf: BytesMut,
    first: bool,
}

impl LineWriter {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            first: true,
        }
    }

    /// Append a field known not to contain the separator
    fn push(&mut self, value: &str) {
        if !self.first {
            self.buf.put_u8(SEPARATOR);
        }
        self.first = false;
        self.buf.put_slice(value.as_bytes());
    }

    /// Append a field that may be empty
    fn field(&mut self, kind: CommandKind, name: &str, value: &str) -> Result<()> {
        if value.as_bytes().contains(&SEPARATOR) {
            return Err(SatError::Encoding(format!(
                "{}: field {} contains the separator",
                kind, name
            )));
        }
        self.push(value);
        Ok(())
    }

    /// Append a required, non-empty field
    fn text(&mut self, kind: CommandKind, name: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(SatError::Encoding(format!("{}: field {} is required", kind, name)));
        }
        self.field(kind, name, value)
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
