//! SAT client
//!
//! One method per SAT library function, on top of a [`CommandExecutor`].
//! The client allocates session numbers and keeps the current activation
//! code, which changes after AtivarSAT and TrocarCodigoDeAtivacao.

use chrono::NaiveDateTime;
use parking_lot::RwLock;

use crate::alerts::{Alert, AlertRegistry};
use crate::error::SatError;
use crate::exchange::CertificateSource;
use crate::executor::{CancelToken, CommandExecutor, ExecResult, ExecutionError};
use crate::protocol::{
    ActivationCodeOption, CertificateKind, CommandPayload, CommandResponse, OperationalStatus,
};
use crate::session::SessionNumber;
use crate::transport::Transport;

pub struct SatClient<T: Transport> {
    executor: CommandExecutor<T>,
    activation_code: RwLock<Option<String>>,
}

impl<T: Transport> SatClient<T> {
    pub fn new(executor: CommandExecutor<T>) -> Self {
        let activation_code = executor.config().activation_code.clone();
        Self {
            executor,
            activation_code: RwLock::new(activation_code),
        }
    }

    pub fn executor(&self) -> &CommandExecutor<T> {
        &self.executor
    }

    /// Activation code currently in use
    pub fn activation_code(&self) -> Option<String> {
        self.activation_code.read().clone()
    }

    /// Run any command under a fresh session
    pub fn run(&self, payload: CommandPayload) -> ExecResult<CommandResponse> {
        self.run_with_cancel(payload, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &self,
        payload: CommandPayload,
        cancel: &CancelToken,
    ) -> ExecResult<CommandResponse> {
        let mut request = self.executor.new_request(payload)?;
        if request.kind().requires_activation_code() {
            request.activation_code = self.activation_code();
        }
        self.executor.execute_with_cancel(request, cancel)
    }

    /// Settle sessions left in doubt (see [`CommandExecutor::reconcile`])
    pub fn reconcile(&self) -> crate::Result<usize> {
        self.executor.reconcile()
    }

    // -------------------------------------------------------------------------
    // SAT functions
    // -------------------------------------------------------------------------

    /// AtivarSAT; on success `activation_code` becomes the client's code
    pub fn activate(
        &self,
        certificate_kind: CertificateKind,
        activation_code: &str,
        cnpj: &str,
        uf_code: u8,
    ) -> ExecResult<CommandResponse> {
        let mut request = self.executor.new_request(CommandPayload::Activate {
            certificate_kind,
            cnpj: cnpj.to_string(),
            uf_code,
        })?;
        request.activation_code = Some(activation_code.to_string());
        let response = self.executor.execute(request)?;
        *self.activation_code.write() = Some(activation_code.to_string());
        Ok(response)
    }

    /// ComunicarCertificadoICPBRASIL
    pub fn communicate_certificate(
        &self,
        source: &dyn CertificateSource,
    ) -> ExecResult<CommandResponse> {
        let certificate = source.certificate()?;
        self.run(CommandPayload::CommunicateCertificate { certificate })
    }

    /// EnviarDadosVenda
    pub fn send_sale(&self, sale_data: &str) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::SendSaleData {
            sale_data: sale_data.to_string(),
        })
    }

    /// CancelarUltimaVenda
    pub fn cancel_last_sale(
        &self,
        cfe_key: &str,
        cancellation_data: &str,
    ) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::CancelLastSale {
            cfe_key: cfe_key.to_string(),
            cancellation_data: cancellation_data.to_string(),
        })
    }

    /// ConsultarSAT
    pub fn query_sat(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::QuerySat)
    }

    /// TesteFimAFim
    pub fn end_to_end_test(&self, sale_data: &str) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::EndToEndTest {
            sale_data: sale_data.to_string(),
        })
    }

    /// ConsultarStatusOperacional, decoded into an [`OperationalStatus`]
    pub fn query_operational_status(&self) -> ExecResult<OperationalStatus> {
        let response = self.run(CommandPayload::QueryOperationalStatus)?;
        OperationalStatus::from_response(&response).map_err(ExecutionError::from)
    }

    /// Query the operational status and run the registered alert checks
    /// against the host's clock
    pub fn check_alerts(&self, registry: &AlertRegistry) -> ExecResult<Vec<Alert>> {
        let status = self.query_operational_status()?;
        Ok(registry.check_now(&status))
    }

    /// [`SatClient::check_alerts`] at a given host time
    pub fn check_alerts_at(
        &self,
        registry: &AlertRegistry,
        now: NaiveDateTime,
    ) -> ExecResult<Vec<Alert>> {
        let status = self.query_operational_status()?;
        Ok(registry.check(&status, now))
    }

    /// ConsultarNumeroSessao
    ///
    /// Answers with the stored response of `target`, whatever command it
    /// carried, or rejects with `11003` when the device never saw it.
    pub fn query_session_number(&self, target: SessionNumber) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::QuerySessionNumber { target })
    }

    /// ConfigurarInterfaceDeRede
    pub fn configure_network(&self, configuration: &str) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::ConfigureNetwork {
            configuration: configuration.to_string(),
        })
    }

    /// AssociarAssinatura
    pub fn associate_signature(
        &self,
        cnpj_sequence: &str,
        signature: &str,
    ) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::AssociateSignature {
            cnpj_sequence: cnpj_sequence.to_string(),
            signature: signature.to_string(),
        })
    }

    /// AtualizarSoftwareSAT
    pub fn update_software(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::UpdateSoftware)
    }

    /// ExtrairLogs
    pub fn extract_logs(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::ExtractLogs)
    }

    /// BloquearSAT
    pub fn block(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::Block)
    }

    /// DesbloquearSAT
    pub fn unblock(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::Unblock)
    }

    /// TrocarCodigoDeAtivacao
    ///
    /// `current_code` is the regular code for [`ActivationCodeOption::Regular`]
    /// and the emergency code for [`ActivationCodeOption::Emergency`]. On
    /// success `new_code` becomes the client's code.
    pub fn change_activation_code(
        &self,
        option: ActivationCodeOption,
        current_code: &str,
        new_code: &str,
        confirmation: &str,
    ) -> ExecResult<CommandResponse> {
        if new_code.is_empty() {
            return Err(SatError::Encoding("new activation code is empty".to_string()).into());
        }
        let mut request = self.executor.new_request(CommandPayload::ChangeActivationCode {
            option,
            new_code: new_code.to_string(),
            confirmation: confirmation.to_string(),
        })?;
        request.activation_code = Some(current_code.to_string());
        let response = self.executor.execute(request)?;
        *self.activation_code.write() = Some(new_code.to_string());
        Ok(response)
    }

    /// ConsultarUltimaSessaoFiscal
    pub fn query_last_fiscal_session(&self) -> ExecResult<CommandResponse> {
        self.run(CommandPayload::QueryLastFiscalSession)
    }
}
