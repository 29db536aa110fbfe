//! Mockup device
//!
//! An in-process SAT that runs on its own thread and talks through
//! crossbeam channels. It keeps enough state (activation code, blocked
//! flag, last fiscal session, per-session replies) to answer re-queries
//! the way a device does, and can be told to misbehave.
//!
//! ```text
//!   MockupTransport ──requests──► device thread ──replies──► MockupTransport
//!                                      ▲
//!   MockupHandle ── faults / state ────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{LinkFault, Received, Transport};
use crate::classifier::codes;
use crate::error::{Result, SatError};
use crate::protocol::{
    decode_request, encode_response, ActivationCodeOption, CertificateKind, CommandKind,
    CommandPayload, CommandRequest, CommandResponse, StatusCode,
};
use crate::session::SessionNumber;

/// How often the device thread checks for shutdown while idle
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Sample CSR returned on activation
const SAMPLE_CSR: &str = "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURSBSRVFVRVNULS0tLS0K";

/// Sample log file returned by ExtrairLogs
const SAMPLE_LOG: &str = "MjAyNjAxMDExMjAwMDB8U0FUfGluZm98RXF1aXBhbWVudG8gaW5pY2lhZG8K";

/// Mockup device configuration
#[derive(Debug, Clone)]
pub struct MockupConfig {
    /// Activation code the device starts with
    pub activation_code: String,

    /// Emergency code accepted by TrocarCodigoDeAtivacao option 2
    pub emergency_code: String,

    /// Reported in `NSERIE`
    pub serial_number: String,

    /// Device clock (`AAAAMMDDhhmmss`) used in every timestamp field
    pub clock: String,

    pub blocked: bool,

    /// Reported in `CERT_VENCIMENTO` (`AAAAMMDD`)
    pub certificate_expires: String,

    /// Access keys reported in `LISTA_INICIAL` and `LISTA_FINAL`; `None`
    /// reports nothing pending
    pub pending_range: Option<(String, String)>,

    /// Replies kept for ConsultarNumeroSessao; the oldest go first
    pub history_limit: usize,
}

impl Default for MockupConfig {
    fn default() -> Self {
        Self {
            activation_code: "12345678".to_string(),
            emergency_code: "87654321".to_string(),
            serial_number: "900004019".to_string(),
            clock: "20260101120000".to_string(),
            blocked: false,
            certificate_expires: "20301231".to_string(),
            pending_range: None,
            history_limit: 1000,
        }
    }
}

/// Misbehaviour applied to the next request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer `FF098` without executing the command
    Busy,

    /// Execute the command but never answer
    DropReply,

    /// Discard the request unread
    Ignore,

    /// Execute the command and answer after the delay
    Delay(Duration),

    /// Answer with a line that is not a SAT response
    Garbage,
}

struct DeviceState {
    config: MockupConfig,

    /// Replies by session, re-queried through ConsultarNumeroSessao
    history: HashMap<SessionNumber, CommandResponse>,

    /// Sessions in `history`, oldest first
    history_order: VecDeque<SessionNumber>,

    /// Reply of the last sale or cancellation
    last_fiscal: Option<CommandResponse>,

    /// Access key of the last sale that can still be cancelled
    cancellable_key: Option<String>,

    /// CF-e counter, used for keys and document numbers
    documents: u32,

    faults: VecDeque<Fault>,
}

/// Control side of a running mockup device
pub struct MockupHandle {
    state: Arc<Mutex<DeviceState>>,
    requests: Sender<Bytes>,
    replies: Receiver<Bytes>,
    running: Arc<AtomicBool>,
    requests_seen: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

/// Application side of the link to a mockup device
pub struct MockupTransport {
    requests: Sender<Bytes>,
    replies: Receiver<Bytes>,
}

/// Factory for mockup devices
pub struct MockupDevice;

impl MockupDevice {
    /// Start a device thread
    pub fn spawn(config: MockupConfig) -> Result<(MockupHandle, MockupTransport)> {
        let (request_tx, request_rx) = channel::unbounded::<Bytes>();
        let (reply_tx, reply_rx) = channel::unbounded::<Bytes>();

        let state = Arc::new(Mutex::new(DeviceState {
            config,
            history: HashMap::new(),
            history_order: VecDeque::new(),
            last_fiscal: None,
            cancellable_key: None,
            documents: 0,
            faults: VecDeque::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));
        let requests_seen = Arc::new(AtomicU64::new(0));

        let thread = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            let requests_seen = Arc::clone(&requests_seen);
            thread::Builder::new()
                .name("sat-mockup".to_string())
                .spawn(move || {
                    device_loop(&state, &running, &requests_seen, &request_rx, &reply_tx)
                })?
        };

        tracing::debug!("Mockup device started");

        Ok((
            MockupHandle {
                state,
                requests: request_tx.clone(),
                replies: reply_rx.clone(),
                running,
                requests_seen,
                thread: Some(thread),
            },
            MockupTransport {
                requests: request_tx,
                replies: reply_rx,
            },
        ))
    }
}

fn device_loop(
    state: &Mutex<DeviceState>,
    running: &AtomicBool,
    requests_seen: &AtomicU64,
    requests: &Receiver<Bytes>,
    replies: &Sender<Bytes>,
) {
    while running.load(Ordering::Relaxed) {
        let frame = match requests.recv_timeout(IDLE_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        requests_seen.fetch_add(1, Ordering::Relaxed);

        let (fault, reply) = {
            let mut state = state.lock();
            let fault = state.faults.pop_front();
            let reply = match fault {
                Some(Fault::Ignore) => None,
                Some(Fault::Garbage) => Some(Bytes::from_static(b"ERRO GERAL NO EQUIPAMENTO")),
                Some(Fault::Busy) => busy_reply(&frame),
                _ => state.handle(&frame),
            };
            (fault, reply)
        };

        match fault {
            Some(Fault::DropReply) | Some(Fault::Ignore) => {
                tracing::debug!("Mockup dropping reply ({:?})", fault);
                continue;
            }
            Some(Fault::Delay(delay)) => thread::sleep(delay),
            _ => {}
        }

        if let Some(reply) = reply {
            if replies.send(reply).is_err() {
                break;
            }
        }
    }
    tracing::debug!("Mockup device stopped");
}

fn busy_reply(frame: &[u8]) -> Option<Bytes> {
    let request = decode_request(frame).ok()?;
    let kind = request.kind();
    let status = StatusCode::in_family(kind, codes::BUSY_SUFFIX);
    let response = CommandResponse::new(kind, request.session, status, "SAT em processamento");
    encode_response(&response).ok()
}

impl DeviceState {
    fn remember(&mut self, session: SessionNumber, response: CommandResponse) {
        if self.history.insert(session, response).is_some() {
            self.history_order.retain(|known| *known != session);
        }
        self.history_order.push_back(session);

        while self.history_order.len() > self.config.history_limit {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }

    /// Execute one request line and build the reply
    fn handle(&mut self, frame: &[u8]) -> Option<Bytes> {
        let request = match decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Mockup received an invalid request: {}", e);
                return None;
            }
        };
        let kind = request.kind();
        tracing::trace!("Mockup executing {} for session {}", kind, request.session);

        let response = self.execute(&request);

        if kind != CommandKind::QuerySessionNumber {
            self.remember(request.session, response.clone());
        }

        match encode_response(&response) {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::warn!("Mockup cannot encode its reply: {}", e);
                None
            }
        }
    }

    fn execute(&mut self, request: &CommandRequest) -> CommandResponse {
        let kind = request.kind();
        let session = request.session;

        if let Some(rejection) = self.check_activation_code(request) {
            return rejection;
        }

        match &request.payload {
            CommandPayload::Activate {
                certificate_kind, ..
            } => {
                if let Some(code) = &request.activation_code {
                    self.config.activation_code = code.clone();
                }
                let (suffix, message) = match certificate_kind {
                    CertificateKind::AcSatSefaz => (0, "Ativado corretamente"),
                    CertificateKind::IcpBrasil | CertificateKind::IcpBrasilRenewal => {
                        (1, "CSR ICP-BRASIL criado com sucesso")
                    }
                };
                reply(kind, session, suffix, message).with_field("CSR", SAMPLE_CSR)
            }
            CommandPayload::CommunicateCertificate { .. } => {
                reply(kind, session, 0, "Certificado transmitido com sucesso")
            }
            CommandPayload::SendSaleData { sale_data } => {
                if self.config.blocked {
                    return reply(kind, session, 3, "SAT bloqueado");
                }
                self.documents += 1;
                let key = self.access_key();
                let response = reply(kind, session, 0, "Emitido com sucesso + conteúdo notas")
                    .with_alert_code("0000")
                    .with_field("arquivoCFeSAT", sale_data.as_str())
                    .with_field("timeStamp", self.config.clock.as_str())
                    .with_field("chaveConsulta", key.as_str())
                    .with_field("valorTotalCFe", "0.00")
                    .with_field("CPFCNPJValue", "")
                    .with_field("assinaturaQRCODE", "UVJDb2Rl");
                self.cancellable_key = Some(key);
                self.last_fiscal = Some(response.clone());
                response
            }
            CommandPayload::CancelLastSale {
                cfe_key,
                cancellation_data,
            } => {
                if self.config.blocked {
                    return reply(kind, session, 3, "SAT bloqueado");
                }
                if self.cancellable_key.as_deref() != Some(cfe_key.as_str()) {
                    return reply(kind, session, 2, "Chave de acesso inválida");
                }
                self.documents += 1;
                let key = self.access_key();
                let response = reply(kind, session, 0, "Cupom cancelado com sucesso")
                    .with_alert_code("0000")
                    .with_field("arquivoCFeBase64", cancellation_data.as_str())
                    .with_field("timeStamp", self.config.clock.as_str())
                    .with_field("chaveConsulta", key.as_str())
                    .with_field("valorTotalCFe", "0.00")
                    .with_field("CPFCNPJValue", "")
                    .with_field("assinaturaQRCODE", "UVJDb2Rl");
                self.cancellable_key = None;
                self.last_fiscal = Some(response.clone());
                response
            }
            CommandPayload::QuerySat => reply(kind, session, 0, "SAT em operação"),
            CommandPayload::EndToEndTest { sale_data } => {
                self.documents += 1;
                let key = self.access_key();
                reply(kind, session, 0, "Emitido com sucesso")
                    .with_field("arquivoCFeBase64", sale_data.as_str())
                    .with_field("timeStamp", self.config.clock.as_str())
                    .with_field("numDocFiscal", format!("{:06}", self.documents))
                    .with_field("chaveConsulta", key)
            }
            CommandPayload::QueryOperationalStatus => self.operational_status(session),
            CommandPayload::QuerySessionNumber { target } => match self.history.get(target) {
                Some(stored) => stored.clone(),
                None => reply(kind, session, 3, "Sessão não existe"),
            },
            CommandPayload::ConfigureNetwork { .. } => {
                reply(kind, session, 0, "Rede configurada com sucesso")
            }
            CommandPayload::AssociateSignature { .. } => {
                reply(kind, session, 0, "Assinatura do AC registrada").with_alert_code("0000")
            }
            CommandPayload::UpdateSoftware => {
                reply(kind, session, 0, "Software atualizado com sucesso")
            }
            CommandPayload::ExtractLogs => {
                reply(kind, session, 0, "Transferência completa").with_field("arquivoLog", SAMPLE_LOG)
            }
            CommandPayload::Block => {
                self.config.blocked = true;
                reply(kind, session, 0, "Equipamento SAT bloqueado com sucesso")
            }
            CommandPayload::Unblock => {
                self.config.blocked = false;
                reply(kind, session, 0, "Equipamento SAT desbloqueado com sucesso")
            }
            CommandPayload::ChangeActivationCode {
                new_code,
                confirmation,
                ..
            } => {
                if new_code != confirmation {
                    return reply(
                        kind,
                        session,
                        2,
                        "Código de ativação novo e confirmação não conferem",
                    );
                }
                self.config.activation_code = new_code.clone();
                reply(kind, session, 0, "Código de ativação alterado com sucesso")
            }
            CommandPayload::QueryLastFiscalSession => match &self.last_fiscal {
                // Answered under the query's own session number
                Some(stored) => {
                    let mut response = stored.clone();
                    response.session = session;
                    response
                }
                None => reply(kind, session, 3, "Nenhuma sessão fiscal registrada"),
            },
        }
    }

    /// `FF001` for a missing or wrong activation code
    fn check_activation_code(&self, request: &CommandRequest) -> Option<CommandResponse> {
        let kind = request.kind();
        if !kind.requires_activation_code() || kind == CommandKind::Activate {
            return None;
        }

        let expected = match &request.payload {
            CommandPayload::ChangeActivationCode { option, .. }
                if *option == ActivationCodeOption::Emergency =>
            {
                &self.config.emergency_code
            }
            _ => &self.config.activation_code,
        };

        (request.activation_code.as_deref() != Some(expected.as_str()))
            .then(|| reply(kind, request.session, 1, "Código de ativação inválido"))
    }

    fn access_key(&self) -> String {
        format!("CFe{:044}", self.documents)
    }

    fn operational_status(&self, session: SessionNumber) -> CommandResponse {
        let zeros = "0".repeat(44);
        let last_cfe = if self.documents == 0 {
            zeros.clone()
        } else {
            format!("{:044}", self.documents)
        };
        let last_transmission = if self.documents == 0 {
            String::new()
        } else {
            self.config.clock.clone()
        };
        let state = if self.config.blocked { "2" } else { "0" };
        let (pending_first, pending_last) = self
            .config
            .pending_range
            .clone()
            .unwrap_or_else(|| (zeros.clone(), zeros.clone()));

        reply(CommandKind::QueryOperationalStatus, session, 0, "Resposta com sucesso")
            .with_field("NSERIE", self.config.serial_number.as_str())
            .with_field("TIPO_LAN", "DHCP")
            .with_field("LAN_IP", "010.000.000.100")
            .with_field("LAN_MAC", "00:00:00:00:00:00")
            .with_field("LAN_MASK", "255.255.255.000")
            .with_field("LAN_GW", "010.000.000.001")
            .with_field("LAN_DNS_1", "010.000.000.001")
            .with_field("LAN_DNS_2", "000.000.000.000")
            .with_field("STATUS_LAN", "CONECTADO")
            .with_field("NIVEL_BATERIA", "ALTO")
            .with_field("MT_TOTAL", "1 GBYTE")
            .with_field("MT_USADA", "0 BYTES")
            .with_field("DH_ATUAL", self.config.clock.as_str())
            .with_field("VER_SB", "01.00.00")
            .with_field("VER_LAYOUT", "00.07")
            .with_field("ULTIMO_CF_E_SAT", last_cfe)
            .with_field("LISTA_INICIAL", pending_first)
            .with_field("LISTA_FINAL", pending_last)
            .with_field("DH_CFE", last_transmission)
            .with_field("DH_ULTIMA", self.config.clock.as_str())
            .with_field("CERT_EMISSAO", "20260101")
            .with_field("CERT_VENCIMENTO", self.config.certificate_expires.as_str())
            .with_field("ESTADO_OPERACAO", state)
    }
}

/// Five-field reply within the command's family
fn reply(kind: CommandKind, session: SessionNumber, suffix: u16, message: &str) -> CommandResponse {
    CommandResponse::new(kind, session, StatusCode::in_family(kind, suffix), message)
}

impl MockupHandle {
    /// Another link to the same device, as after an application restart
    ///
    /// Every link shares one reply queue; use one at a time.
    pub fn connect(&self) -> MockupTransport {
        MockupTransport {
            requests: self.requests.clone(),
            replies: self.replies.clone(),
        }
    }

    /// Queue a fault for the next request (faults apply in order)
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.state.lock().config.blocked = blocked;
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().config.blocked
    }

    /// Activation code currently configured on the device
    pub fn activation_code(&self) -> String {
        self.state.lock().config.activation_code.clone()
    }

    /// Whether the device executed a command under this session
    pub fn knows_session(&self, session: SessionNumber) -> bool {
        self.state.lock().history.contains_key(&session)
    }

    /// Number of request lines received so far
    pub fn requests_seen(&self) -> u64 {
        self.requests_seen.load(Ordering::Relaxed)
    }

    /// Stop the device thread and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Mockup device thread panicked");
            }
        }
    }
}

impl Drop for MockupHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Transport for MockupTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.requests
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| SatError::Link(LinkFault::NoConnect))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received> {
        match self.replies.recv_timeout(timeout) {
            Ok(frame) => Ok(Received::Frame(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(Received::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(SatError::Link(LinkFault::NoConnect)),
        }
    }
}
