//! Stripe card rail over the payment-intents API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::payments::{PaymentProvider, PaymentRail, PaymentRequest, PaymentResult, PaymentStatus};
use crate::PaymentError;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

fn map_intent_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Completed,
        "processing" => PaymentStatus::Processing,
        "requires_capture" => PaymentStatus::Authorized,
        "canceled" => PaymentStatus::Cancelled,
        "requires_payment_method" | "requires_confirmation" | "requires_action" => {
            PaymentStatus::Pending
        }
        _ => PaymentStatus::Pending,
    }
}

/// Stripe provider. The secret key usually arrives via
/// `KILN_STRIPE_SECRET_KEY`.
pub struct StripeProvider {
    client: Client,
    api_base: String,
    secret_key: String,
}

impl StripeProvider {
    pub fn new(secret_key: &str) -> Self {
        Self::with_api_base(secret_key, DEFAULT_API_BASE)
    }

    pub fn with_api_base(secret_key: &str, api_base: &str) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<Value, PaymentError> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|err| PaymentError::with_code(format!("stripe request failed: {err}"), "NETWORK"))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| PaymentError::with_code(format!("stripe returned invalid JSON: {err}"), "PROTOCOL"))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown Stripe error")
                .to_string();
            let code = body["error"]["code"]
                .as_str()
                .unwrap_or("STRIPE_ERROR")
                .to_uppercase();
            return Err(PaymentError::with_code(message, &code));
        }
        Ok(body)
    }

    fn intent_result(&self, body: &Value) -> PaymentResult {
        let amount_minor = body["amount"].as_f64().unwrap_or(0.0);
        PaymentResult {
            success: true,
            payment_id: body["id"].as_str().unwrap_or_default().to_string(),
            status: map_intent_status(body["status"].as_str().unwrap_or("")),
            amount: amount_minor / 100.0,
            currency: body["currency"]
                .as_str()
                .unwrap_or("usd")
                .to_uppercase(),
            rail: "stripe".into(),
            tx_hash: None,
        }
    }

    fn intent_form(request: &PaymentRequest, capture: bool) -> Vec<(String, String)> {
        let mut form = vec![
            // Stripe amounts are integer minor units.
            ("amount".into(), format!("{}", (request.amount * 100.0).round() as i64)),
            ("currency".into(), request.currency.to_lowercase()),
            ("description".into(), request.description.clone()),
            ("confirm".into(), "true".into()),
            ("metadata[job_id]".into(), request.job_id.clone()),
        ];
        if !capture {
            form.push(("capture_method".into(), "manual".into()));
        }
        form
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &str {
        "stripe"
    }

    fn rail(&self) -> PaymentRail {
        PaymentRail::Stripe
    }

    fn supported_currencies(&self) -> Vec<String> {
        vec!["USD".into(), "EUR".into(), "GBP".into()]
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, PaymentError> {
        let body = self
            .post_form("/v1/payment_intents", &Self::intent_form(request, true))
            .await?;
        Ok(self.intent_result(&body))
    }

    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{payment_id}", self.api_base))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|err| PaymentError::with_code(format!("stripe request failed: {err}"), "NETWORK"))?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| PaymentError::with_code(format!("stripe returned invalid JSON: {err}"), "PROTOCOL"))?;
        Ok(self.intent_result(&body))
    }

    async fn refund_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let body = self
            .post_form(
                "/v1/refunds",
                &[("payment_intent".into(), payment_id.to_string())],
            )
            .await?;
        Ok(PaymentResult {
            success: true,
            payment_id: payment_id.to_string(),
            status: PaymentStatus::Refunded,
            amount: body["amount"].as_f64().unwrap_or(0.0) / 100.0,
            currency: body["currency"].as_str().unwrap_or("usd").to_uppercase(),
            rail: "stripe".into(),
            tx_hash: None,
        })
    }

    async fn authorize_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, PaymentError> {
        let body = self
            .post_form("/v1/payment_intents", &Self::intent_form(request, false))
            .await?;
        Ok(self.intent_result(&body))
    }

    async fn capture_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let body = self
            .post_form(&format!("/v1/payment_intents/{payment_id}/capture"), &[])
            .await?;
        Ok(self.intent_result(&body))
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<PaymentResult, PaymentError> {
        let body = self
            .post_form(&format!("/v1/payment_intents/{payment_id}/cancel"), &[])
            .await?;
        Ok(self.intent_result(&body))
    }
}
