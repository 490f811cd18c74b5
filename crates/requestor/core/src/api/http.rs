//! HTTP client for the marketplace daemon REST API

use super::DaemonApi;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{
    ActivityData, AgreementData, AllocationData, CommandOutcome, CommandResult, DebitNoteData,
    DemandData, InvoiceData, MarketEvent, PaymentEvent, Properties, ProposalData, ProposalState,
    ResourceId, Script,
};
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:7465";

/// Connection settings for [`HttpDaemonApi`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Application key sent as a bearer token
    #[serde(default)]
    pub app_key: Option<String>,

    #[serde(default = "default_market_prefix")]
    pub market_prefix: String,

    #[serde(default = "default_payment_prefix")]
    pub payment_prefix: String,

    #[serde(default = "default_activity_prefix")]
    pub activity_prefix: String,

    #[serde(default = "default_net_prefix")]
    pub net_prefix: String,

    /// Client-side timeout added on top of long-poll timeouts
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            app_key: None,
            market_prefix: default_market_prefix(),
            payment_prefix: default_payment_prefix(),
            activity_prefix: default_activity_prefix(),
            net_prefix: default_net_prefix(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_url() -> String {
    DEFAULT_DAEMON_URL.to_string()
}

fn default_market_prefix() -> String {
    "/market-api/v1".to_string()
}

fn default_payment_prefix() -> String {
    "/payment-api/v1".to_string()
}

fn default_activity_prefix() -> String {
    "/activity-api/v1".to_string()
}

fn default_net_prefix() -> String {
    "/net-api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// [`DaemonApi`] over the daemon's REST endpoints
pub struct HttpDaemonApi {
    client: Client,
    config: HttpApiConfig,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDemand {
    #[serde(default)]
    demand_id: Option<String>,
    properties: Properties,
    constraints: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProposal {
    proposal_id: String,
    issuer_id: String,
    state: String,
    #[serde(default)]
    prev_proposal_id: Option<String>,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    constraints: String,
    timestamp: DateTime<Utc>,
}

impl WireProposal {
    fn into_data(self) -> ProposalData {
        let state = match self.state.as_str() {
            "Initial" => ProposalState::Initial,
            "Rejected" | "Expired" => ProposalState::Rejected,
            _ => ProposalState::Draft,
        };
        ProposalData {
            proposal_id: ResourceId::new(self.proposal_id),
            issuer_id: self.issuer_id,
            state,
            prev_proposal_id: self.prev_proposal_id.map(ResourceId::new),
            properties: self.properties,
            constraints: self.constraints,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "eventType")]
enum WireMarketEvent {
    ProposalEvent {
        proposal: WireProposal,
    },
    ProposalRejectedEvent {
        #[serde(rename = "proposalId")]
        proposal_id: String,
        #[serde(default)]
        reason: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAgreement {
    agreement_id: String,
    #[serde(default)]
    offer: Option<Value>,
    #[serde(default)]
    demand: Option<Value>,
    valid_to: DateTime<Utc>,
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExeResult {
    index: usize,
    event_date: DateTime<Utc>,
    result: String,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    message: Option<String>,
    is_batch_finished: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAllocation {
    allocation_id: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    payment_platform: Option<String>,
    total_amount: Value,
    remaining_amount: Value,
    #[serde(default)]
    timeout: Option<DateTime<Utc>>,
}

impl WireAllocation {
    fn into_data(self) -> ApiResult<AllocationData> {
        Ok(AllocationData {
            allocation_id: ResourceId::new(self.allocation_id),
            total_amount: parse_amount(&self.total_amount)?,
            remaining_amount: parse_amount(&self.remaining_amount)?,
            payment_platform: self.payment_platform.unwrap_or_default(),
            address: self.address.unwrap_or_default(),
            timeout: self.timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDebitNote {
    debit_note_id: String,
    activity_id: String,
    agreement_id: String,
    total_amount_due: Value,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInvoice {
    invoice_id: String,
    agreement_id: String,
    #[serde(default)]
    activity_ids: Vec<String>,
    amount: Value,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePaymentEvent {
    event_type: String,
    event_date: DateTime<Utc>,
    #[serde(default)]
    debit_note_id: Option<String>,
    #[serde(default)]
    invoice_id: Option<String>,
}

/// Amounts travel as decimal strings; accept plain numbers too.
fn parse_amount(value: &Value) -> ApiResult<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => return Err(ApiError::Decode(format!("invalid amount {}", other))),
    };
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| ApiError::Decode(format!("invalid amount '{}': {}", text, e)))
}

/// Ids come back either as a bare JSON string or wrapped in an object.
fn extract_id(value: Value, field: &str) -> ApiResult<ResourceId> {
    match value {
        Value::String(id) => Ok(ResourceId::new(id)),
        Value::Object(map) => map
            .get(field)
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(ResourceId::new)
            .ok_or_else(|| ApiError::Decode(format!("missing {} in response", field))),
        other => Err(ApiError::Decode(format!("unexpected id payload {}", other))),
    }
}

fn timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64()
}

impl HttpDaemonApi {
    pub fn new(config: HttpApiConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn request(&self, method: Method, prefix: &str, path: &str) -> RequestBuilder {
        let url = format!("{}{}{}", self.base_url, prefix, path);
        let builder = self.client.request(method, url);
        match &self.config.app_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn market(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, &self.config.market_prefix, path)
    }

    fn activity(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, &self.config.activity_prefix, path)
    }

    fn payment(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, &self.config.payment_prefix, path)
    }

    fn net(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, &self.config.net_prefix, path)
    }

    /// Long-poll requests need a client timeout longer than the server-side one.
    fn long_poll(&self, builder: RequestBuilder, timeout: Duration) -> RequestBuilder {
        builder.timeout(timeout + Duration::from_secs(self.config.request_timeout_secs))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), &body))
        }
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ApiResult<()> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), &body))
        }
    }
}

#[async_trait]
impl DaemonApi for HttpDaemonApi {
    async fn subscribe_demand(&self, demand: &DemandData) -> ApiResult<ResourceId> {
        let body = json!({
            "properties": demand.properties,
            "constraints": demand.constraints,
        });
        let id: Value = self
            .send_json(self.market(Method::POST, "/demands").json(&body))
            .await?;
        extract_id(id, "demandId")
    }

    async fn unsubscribe_demand(&self, demand_id: &ResourceId) -> ApiResult<()> {
        self.send_empty(self.market(Method::DELETE, &format!("/demands/{}", demand_id)))
            .await
    }

    async fn get_demand(&self, demand_id: &ResourceId) -> ApiResult<DemandData> {
        let demands: Vec<WireDemand> = self.send_json(self.market(Method::GET, "/demands")).await?;
        demands
            .into_iter()
            .find(|d| d.demand_id.as_deref() == Some(demand_id.as_str()))
            .map(|d| DemandData {
                properties: d.properties,
                constraints: d.constraints,
            })
            .ok_or_else(|| ApiError::NotFound(format!("demand {}", demand_id)))
    }

    async fn collect_offers(
        &self,
        demand_id: &ResourceId,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<MarketEvent>> {
        let builder = self
            .market(Method::GET, &format!("/demands/{}/events", demand_id))
            .query(&[
                ("timeout", timeout_secs(timeout).to_string()),
                ("maxEvents", max_events.to_string()),
            ]);
        let events: Vec<WireMarketEvent> =
            self.send_json(self.long_poll(builder, timeout)).await?;

        Ok(events
            .into_iter()
            .filter_map(|event| match event {
                WireMarketEvent::ProposalEvent { proposal } => {
                    Some(MarketEvent::Proposal(proposal.into_data()))
                }
                WireMarketEvent::ProposalRejectedEvent {
                    proposal_id,
                    reason,
                } => Some(MarketEvent::ProposalRejected {
                    proposal_id: ResourceId::new(proposal_id),
                    reason: reason.map(|r| r.to_string()),
                }),
                WireMarketEvent::Other => None,
            })
            .collect())
    }

    async fn get_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
    ) -> ApiResult<ProposalData> {
        let proposal: WireProposal = self
            .send_json(self.market(
                Method::GET,
                &format!("/demands/{}/proposals/{}", demand_id, proposal_id),
            ))
            .await?;
        Ok(proposal.into_data())
    }

    async fn counter_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
        counter: &DemandData,
    ) -> ApiResult<ResourceId> {
        let body = json!({
            "properties": counter.properties,
            "constraints": counter.constraints,
        });
        let id: Value = self
            .send_json(
                self.market(
                    Method::POST,
                    &format!("/demands/{}/proposals/{}", demand_id, proposal_id),
                )
                .json(&body),
            )
            .await?;
        extract_id(id, "proposalId")
    }

    async fn reject_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
        reason: &str,
    ) -> ApiResult<()> {
        self.send_empty(
            self.market(
                Method::POST,
                &format!("/demands/{}/proposals/{}/reject", demand_id, proposal_id),
            )
            .json(&json!({ "message": reason })),
        )
        .await
    }

    async fn create_agreement(
        &self,
        proposal_id: &ResourceId,
        valid_to: DateTime<Utc>,
    ) -> ApiResult<ResourceId> {
        let body = json!({ "proposalId": proposal_id, "validTo": valid_to });
        let id: Value = self
            .send_json(self.market(Method::POST, "/agreements").json(&body))
            .await?;
        extract_id(id, "agreementId")
    }

    async fn get_agreement(&self, agreement_id: &ResourceId) -> ApiResult<AgreementData> {
        let agreement: WireAgreement = self
            .send_json(self.market(Method::GET, &format!("/agreements/{}", agreement_id)))
            .await?;

        let offer = agreement.offer.unwrap_or(Value::Null);
        let provider_id = offer
            .get("providerId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let proposal_id = offer
            .get("offerId")
            .or_else(|| agreement.demand.as_ref().and_then(|d| d.get("demandId")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(AgreementData {
            agreement_id: ResourceId::new(agreement.agreement_id),
            proposal_id: ResourceId::new(proposal_id),
            provider_id,
            valid_to: agreement.valid_to,
            state: agreement.state,
        })
    }

    async fn confirm_agreement(&self, agreement_id: &ResourceId) -> ApiResult<()> {
        self.send_empty(self.market(
            Method::POST,
            &format!("/agreements/{}/confirm", agreement_id),
        ))
        .await
    }

    async fn wait_for_approval(
        &self,
        agreement_id: &ResourceId,
        timeout: Duration,
    ) -> ApiResult<()> {
        let builder = self
            .market(Method::POST, &format!("/agreements/{}/wait", agreement_id))
            .query(&[("timeout", timeout_secs(timeout).to_string())]);
        self.send_empty(self.long_poll(builder, timeout)).await
    }

    async fn terminate_agreement(&self, agreement_id: &ResourceId, reason: &str) -> ApiResult<()> {
        self.send_empty(
            self.market(
                Method::POST,
                &format!("/agreements/{}/terminate", agreement_id),
            )
            .json(&json!({ "message": reason })),
        )
        .await
    }

    async fn create_activity(&self, agreement_id: &ResourceId) -> ApiResult<ResourceId> {
        let id: Value = self
            .send_json(
                self.activity(Method::POST, "/activity")
                    .json(&json!({ "agreementId": agreement_id })),
            )
            .await?;
        extract_id(id, "activityId")
    }

    async fn get_activity(&self, activity_id: &ResourceId) -> ApiResult<ActivityData> {
        let state: Value = self
            .send_json(self.activity(Method::GET, &format!("/activity/{}/state", activity_id)))
            .await?;
        let agreement: Value = self
            .send_json(self.activity(
                Method::GET,
                &format!("/activity/{}/agreement", activity_id),
            ))
            .await?;

        let state = state
            .get("state")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        Ok(ActivityData {
            activity_id: activity_id.clone(),
            agreement_id: extract_id(agreement, "agreementId")?,
            state,
        })
    }

    async fn destroy_activity(&self, activity_id: &ResourceId) -> ApiResult<()> {
        self.send_empty(self.activity(Method::DELETE, &format!("/activity/{}", activity_id)))
            .await
    }

    async fn exec(&self, activity_id: &ResourceId, script: &Script) -> ApiResult<ResourceId> {
        let text = script.to_exe_script().to_string();
        debug!(activity_id = %activity_id, commands = script.len(), "Submitting exe script");
        let id: Value = self
            .send_json(
                self.activity(Method::POST, &format!("/activity/{}/exec", activity_id))
                    .json(&json!({ "text": text })),
            )
            .await?;
        extract_id(id, "batchId")
    }

    async fn get_exec_batch_results(
        &self,
        activity_id: &ResourceId,
        batch_id: &ResourceId,
        timeout: Duration,
    ) -> ApiResult<Vec<CommandResult>> {
        let builder = self
            .activity(
                Method::GET,
                &format!("/activity/{}/exec/{}", activity_id, batch_id),
            )
            .query(&[("timeout", timeout_secs(timeout).to_string())]);

        let results: Vec<WireExeResult> =
            match self.send_json(self.long_poll(builder, timeout)).await {
                Ok(results) => results,
                // No news within the poll window
                Err(ApiError::Timeout(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };

        Ok(results
            .into_iter()
            .map(|r| CommandResult {
                index: r.index,
                event_date: r.event_date,
                outcome: if r.result == "Error" {
                    CommandOutcome::Error
                } else {
                    CommandOutcome::Ok
                },
                stdout: r.stdout,
                stderr: r.stderr,
                message: r.message,
                is_batch_finished: r.is_batch_finished,
            })
            .collect())
    }

    async fn create_allocation(
        &self,
        amount: Decimal,
        payment_platform: &str,
        expires: Option<DateTime<Utc>>,
    ) -> ApiResult<AllocationData> {
        let body = json!({
            "totalAmount": amount.to_string(),
            "paymentPlatform": payment_platform,
            "makeDeposit": false,
            "timeout": expires,
        });
        let allocation: WireAllocation = self
            .send_json(self.payment(Method::POST, "/allocations").json(&body))
            .await?;
        allocation.into_data()
    }

    async fn get_allocation(&self, allocation_id: &ResourceId) -> ApiResult<AllocationData> {
        let allocation: WireAllocation = self
            .send_json(self.payment(Method::GET, &format!("/allocations/{}", allocation_id)))
            .await?;
        allocation.into_data()
    }

    async fn release_allocation(&self, allocation_id: &ResourceId) -> ApiResult<()> {
        self.send_empty(self.payment(
            Method::DELETE,
            &format!("/allocations/{}", allocation_id),
        ))
        .await
    }

    async fn collect_payment_events(
        &self,
        after: Option<DateTime<Utc>>,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<PaymentEvent>> {
        let mut query = vec![
            ("timeout", timeout_secs(timeout).to_string()),
            ("maxEvents", max_events.to_string()),
        ];
        if let Some(after) = after {
            query.push(("afterTimestamp", after.to_rfc3339()));
        }

        let debit_builder = self.payment(Method::GET, "/debitNoteEvents").query(&query);
        let mut events: Vec<WirePaymentEvent> =
            self.send_json(self.long_poll(debit_builder, timeout)).await?;

        // Invoices are rare; don't hold the poll for them.
        query[0].1 = "0".to_string();
        let invoice_builder = self.payment(Method::GET, "/invoiceEvents").query(&query);
        let invoices: Vec<WirePaymentEvent> = self.send_json(invoice_builder).await?;
        events.extend(invoices);
        events.sort_by_key(|e| e.event_date);

        Ok(events
            .into_iter()
            .filter(|e| e.event_type.ends_with("ReceivedEvent"))
            .filter_map(|e| match (e.debit_note_id, e.invoice_id) {
                (Some(id), _) => Some(PaymentEvent::DebitNoteReceived {
                    debit_note_id: ResourceId::new(id),
                    event_date: e.event_date,
                }),
                (None, Some(id)) => Some(PaymentEvent::InvoiceReceived {
                    invoice_id: ResourceId::new(id),
                    event_date: e.event_date,
                }),
                (None, None) => None,
            })
            .take(max_events)
            .collect())
    }

    async fn get_debit_note(&self, debit_note_id: &ResourceId) -> ApiResult<DebitNoteData> {
        let note: WireDebitNote = self
            .send_json(self.payment(Method::GET, &format!("/debitNotes/{}", debit_note_id)))
            .await?;
        Ok(DebitNoteData {
            debit_note_id: ResourceId::new(note.debit_note_id),
            activity_id: ResourceId::new(note.activity_id),
            agreement_id: ResourceId::new(note.agreement_id),
            total_amount_due: parse_amount(&note.total_amount_due)?,
            timestamp: note.timestamp,
        })
    }

    async fn accept_debit_note(
        &self,
        debit_note_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()> {
        let body = json!({
            "totalAmountAccepted": amount.to_string(),
            "allocationId": allocation_id,
        });
        self.send_empty(
            self.payment(
                Method::POST,
                &format!("/debitNotes/{}/accept", debit_note_id),
            )
            .json(&body),
        )
        .await
    }

    async fn reject_debit_note(&self, debit_note_id: &ResourceId, reason: &str) -> ApiResult<()> {
        let body = json!({
            "rejectionReason": "UNSOLICITED_SERVICE",
            "totalAmountAccepted": "0",
            "message": reason,
        });
        self.send_empty(
            self.payment(
                Method::POST,
                &format!("/debitNotes/{}/reject", debit_note_id),
            )
            .json(&body),
        )
        .await
    }

    async fn get_invoice(&self, invoice_id: &ResourceId) -> ApiResult<InvoiceData> {
        let invoice: WireInvoice = self
            .send_json(self.payment(Method::GET, &format!("/invoices/{}", invoice_id)))
            .await?;
        Ok(InvoiceData {
            invoice_id: ResourceId::new(invoice.invoice_id),
            agreement_id: ResourceId::new(invoice.agreement_id),
            activity_ids: invoice
                .activity_ids
                .into_iter()
                .map(ResourceId::new)
                .collect(),
            amount: parse_amount(&invoice.amount)?,
            timestamp: invoice.timestamp,
        })
    }

    async fn accept_invoice(
        &self,
        invoice_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()> {
        let body = json!({
            "totalAmountAccepted": amount.to_string(),
            "allocationId": allocation_id,
        });
        self.send_empty(
            self.payment(Method::POST, &format!("/invoices/{}/accept", invoice_id))
                .json(&body),
        )
        .await
    }

    async fn reject_invoice(&self, invoice_id: &ResourceId, reason: &str) -> ApiResult<()> {
        let body = json!({
            "rejectionReason": "UNSOLICITED_SERVICE",
            "totalAmountAccepted": "0",
            "message": reason,
        });
        self.send_empty(
            self.payment(Method::POST, &format!("/invoices/{}/reject", invoice_id))
                .json(&body),
        )
        .await
    }

    async fn create_network(
        &self,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ApiResult<ResourceId> {
        let body = json!({
            "ip": ip.to_string(),
            "mask": mask.to_string(),
            "gateway": gateway.map(|g| g.to_string()),
        });
        let network: Value = self
            .send_json(self.net(Method::POST, "/net").json(&body))
            .await?;
        extract_id(network, "id")
    }

    async fn add_network_node(
        &self,
        network_id: &ResourceId,
        node_id: &str,
        ip: Ipv4Addr,
    ) -> ApiResult<()> {
        self.send_empty(
            self.net(Method::POST, &format!("/net/{}/nodes", network_id))
                .json(&json!({ "id": node_id, "ip": ip.to_string() })),
        )
        .await
    }

    async fn add_requestor_address(&self, network_id: &ResourceId, ip: Ipv4Addr) -> ApiResult<()> {
        self.send_empty(
            self.net(Method::POST, &format!("/net/{}/addresses", network_id))
                .json(&json!({ "ip": ip.to_string() })),
        )
        .await
    }

    async fn remove_network(&self, network_id: &ResourceId) -> ApiResult<()> {
        self.send_empty(self.net(Method::DELETE, &format!("/net/{}", network_id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_points_at_local_daemon() {
        let config = HttpApiConfig::default();
        assert_eq!(config.url, "http://127.0.0.1:7465");
        assert_eq!(config.market_prefix, "/market-api/v1");
        assert_eq!(config.net_prefix, "/net-api/v1");
        assert!(config.app_key.is_none());
    }

    #[test]
    fn test_parse_amount_accepts_strings_and_numbers() {
        assert_eq!(parse_amount(&json!("0.25")).unwrap(), Decimal::new(25, 2));
        assert_eq!(parse_amount(&json!(1.5)).unwrap(), Decimal::new(15, 1));
        assert_eq!(parse_amount(&json!(1e-7)).unwrap(), Decimal::new(1, 7));
        assert!(parse_amount(&json!("abc")).is_err());
        assert!(parse_amount(&json!(null)).is_err());
    }

    #[test]
    fn test_extract_id_shapes() {
        assert_eq!(extract_id(json!("a1"), "activityId").unwrap().as_str(), "a1");
        assert_eq!(
            extract_id(json!({"activityId": "a2"}), "activityId")
                .unwrap()
                .as_str(),
            "a2"
        );
        assert!(extract_id(json!(3), "activityId").is_err());
    }

    #[test]
    fn test_market_event_decoding() {
        let raw = json!([
            {
                "eventType": "ProposalEvent",
                "eventDate": "2024-01-01T00:00:00Z",
                "proposal": {
                    "proposalId": "p1",
                    "issuerId": "0xprov",
                    "state": "Initial",
                    "properties": {"golem.inf.mem.gib": 4},
                    "constraints": "()",
                    "timestamp": "2024-01-01T00:00:00Z"
                }
            },
            {
                "eventType": "ProposalRejectedEvent",
                "eventDate": "2024-01-01T00:00:01Z",
                "proposalId": "p2"
            },
            { "eventType": "PropertyQueryEvent", "eventDate": "2024-01-01T00:00:02Z" }
        ]);
        let events: Vec<WireMarketEvent> = serde_json::from_value(raw).unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            WireMarketEvent::ProposalEvent { proposal } => {
                assert_eq!(proposal.proposal_id, "p1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[2], WireMarketEvent::Other));
    }
}
