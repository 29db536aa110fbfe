//! Protocol Module
//!
//! Defines the wire protocol between the commercial application (AC) and
//! the SAT.
//!
//! ## Protocol Format
//!
//! Text lines, fields joined by `|`, no escaping.
//!
//! ### Request
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ Function     │ numeroSessao │ arguments (per function)     │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! ### Response
//! ```text
//! ┌──────────────┬───────┬────────┬──────────┬─────┬───────────────┬──────────┐
//! │ numeroSessao │ EEEEE │ [CCCC] │ mensagem │ cod │ mensagemSEFAZ │ trailing │
//! └──────────────┴───────┴────────┴──────────┴─────┴───────────────┴──────────┘
//! ```
//!
//! ### Status Codes
//! `EEEEE` is always five digits: two for the command family, three for the
//! result (`08000` = ConsultarSAT succeeded, `06001` = EnviarDadosVenda
//! rejected, ...). See [`crate::classifier`].

mod command;
mod response;
mod codec;
pub mod datetime;
pub mod schema;
mod status;

pub use command::{
    ActivationCodeOption, CertificateKind, CommandKind, CommandPayload, CommandRequest,
};
pub use response::{CommandResponse, SefazReply, StatusCode, STATUS_WIDTH};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, peek_session, SEPARATOR,
};
pub use status::{OperationState, OperationalStatus};
