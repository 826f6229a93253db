//! Carrier and host clients built from the effective configuration.

use anyhow::{Context, Result, bail};
use plp::config::RuntimeOptions;
use plp::gateway::{
    CarrierGateway, GatewayError, HttpCarrierGateway, HttpHost, HttpSettings, LabelDownload,
    LabelReceipt, OrderSource, ShipmentRecord, ShipmentSubsystem, Submission,
};
use plp::types::{Declaration, Order, Stage};

/// The carrier API, or a placeholder when `[carrier] api_base` is unset.
pub enum Carrier {
    Http(HttpCarrierGateway),
    Unconfigured,
}

/// The host API, or a placeholder when `[host] api_base` is unset.
pub enum Host {
    Http(HttpHost),
    Unconfigured,
}

impl Carrier {
    pub fn from_options(opts: &RuntimeOptions) -> Result<Self> {
        let Some(api_base) = &opts.carrier.api_base else {
            return Ok(Carrier::Unconfigured);
        };
        let settings = HttpSettings::new(api_base.clone())
            .with_token(opts.carrier.token.clone())
            .with_timeout(opts.carrier.timeout);
        let client = HttpCarrierGateway::new(&settings).context("failed to build carrier client")?;
        Ok(Carrier::Http(client))
    }

    fn http(&self) -> Result<&HttpCarrierGateway, GatewayError> {
        match self {
            Carrier::Http(client) => Ok(client),
            Carrier::Unconfigured => Err(GatewayError::InvalidRequest(
                "carrier.api_base is not configured".to_string(),
            )),
        }
    }
}

impl Host {
    pub fn from_options(opts: &RuntimeOptions) -> Result<Self> {
        let Some(api_base) = &opts.host.api_base else {
            return Ok(Host::Unconfigured);
        };
        let settings = HttpSettings::new(api_base.clone())
            .with_token(opts.host.token.clone())
            .with_timeout(opts.host.timeout);
        let client = HttpHost::new(&settings).context("failed to build host client")?;
        Ok(Host::Http(client))
    }

    fn http(&self) -> Result<&HttpHost, GatewayError> {
        match self {
            Host::Http(client) => Ok(client),
            Host::Unconfigured => Err(GatewayError::InvalidRequest(
                "host.api_base is not configured".to_string(),
            )),
        }
    }
}

impl CarrierGateway for Carrier {
    fn submit(&self, declaration: &Declaration) -> Result<Submission, GatewayError> {
        self.http()?.submit(declaration)
    }

    fn request_label(&self, tracking_code: &str) -> Result<LabelReceipt, GatewayError> {
        self.http()?.request_label(tracking_code)
    }

    fn download_label(&self, receipt_id: &str) -> Result<LabelDownload, GatewayError> {
        self.http()?.download_label(receipt_id)
    }
}

impl OrderSource for Host {
    fn get_order(&self, order_ref: &str) -> Result<Order, GatewayError> {
        self.http()?.get_order(order_ref)
    }
}

impl ShipmentSubsystem for Host {
    fn is_shippable(&self, order_ref: &str) -> Result<bool, GatewayError> {
        self.http()?.is_shippable(order_ref)
    }

    fn register_shipment(&self, record: &ShipmentRecord) -> Result<String, GatewayError> {
        self.http()?.register_shipment(record)
    }

    fn notify(&self, shipment_ref: &str) -> Result<(), GatewayError> {
        self.http()?.notify(shipment_ref)
    }
}

/// Refuse to start when a stage in `stages` needs an API that is not
/// configured, instead of failing every item one by one.
pub fn require_endpoints(stages: &[Stage], opts: &RuntimeOptions) -> Result<()> {
    for stage in stages {
        match stage {
            Stage::Collection | Stage::Shipment if opts.host.api_base.is_none() => bail!(
                "{stage} needs the host API: set [host] api_base in plp.toml or pass --host-api"
            ),
            Stage::Submission | Stage::LabelRequest | Stage::LabelDownload
                if opts.carrier.api_base.is_none() =>
            {
                bail!(
                    "{stage} needs the carrier API: set [carrier] api_base in plp.toml or pass --carrier-api"
                )
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoints_are_reported_per_stage() {
        let mut opts = RuntimeOptions::default();
        let err = require_endpoints(&[Stage::Submission], &opts).expect_err("no carrier");
        assert!(err.to_string().contains("submission needs the carrier API"));

        opts.carrier.api_base = Some("http://127.0.0.1:1".into());
        require_endpoints(&[Stage::Submission, Stage::LabelDownload], &opts).expect("carrier only");
        let err = require_endpoints(Stage::ALL, &opts).expect_err("no host");
        assert!(err.to_string().contains("collection needs the host API"));
    }

    #[test]
    fn unconfigured_clients_fail_as_invalid_requests() {
        let opts = RuntimeOptions::default();
        let host = Host::from_options(&opts).expect("host");
        assert!(matches!(
            host.get_order("o-1"),
            Err(GatewayError::InvalidRequest(message)) if message.contains("host.api_base")
        ));
    }
}
