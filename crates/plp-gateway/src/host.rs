use plp_types::Order;
use serde::Deserialize;
use tracing::debug;

use crate::http::{ApiClient, decode, ensure_success};
use crate::{GatewayError, HttpSettings, OrderSource, ShipmentRecord, ShipmentSubsystem};

/// Host system API: order data plus shipment registration.
///
/// Endpoints, relative to `api_base`:
///
/// - `GET orders/{order_ref}`
/// - `GET orders/{order_ref}/shippable` returning `{"shippable": bool}`
/// - `POST shipments` with a [`ShipmentRecord`], returning `{"shipment_ref": ..}`
/// - `POST shipments/{shipment_ref}/notify`
#[derive(Debug, Clone)]
pub struct HttpHost {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct ShippableResponse {
    shippable: bool,
}

#[derive(Debug, Deserialize)]
struct ShipmentCreated {
    shipment_ref: String,
}

impl HttpHost {
    pub fn new(settings: &HttpSettings) -> Result<Self, GatewayError> {
        Ok(Self {
            api: ApiClient::new(settings)?,
        })
    }
}

impl OrderSource for HttpHost {
    fn get_order(&self, order_ref: &str) -> Result<Order, GatewayError> {
        let resp = self.api.get(&["orders", order_ref])?.send()?;
        let order: Order = decode(ensure_success(resp)?, "order")?;
        if order.order_ref != order_ref {
            return Err(GatewayError::Decode(format!(
                "asked for order {order_ref}, host returned {}",
                order.order_ref
            )));
        }
        Ok(order)
    }
}

impl ShipmentSubsystem for HttpHost {
    fn is_shippable(&self, order_ref: &str) -> Result<bool, GatewayError> {
        let resp = self.api.get(&["orders", order_ref, "shippable"])?.send()?;
        let answer: ShippableResponse = decode(ensure_success(resp)?, "shippable response")?;
        Ok(answer.shippable)
    }

    fn register_shipment(&self, record: &ShipmentRecord) -> Result<String, GatewayError> {
        debug!(order_ref = %record.order_ref, tracking_code = %record.tracking_code, "registering shipment");
        let resp = self.api.post(&["shipments"])?.json(record).send()?;
        let created: ShipmentCreated = decode(ensure_success(resp)?, "shipment response")?;
        Ok(created.shipment_ref)
    }

    fn notify(&self, shipment_ref: &str) -> Result<(), GatewayError> {
        let resp = self
            .api
            .post(&["shipments", shipment_ref, "notify"])?
            .send()?;
        ensure_success(resp)?;
        Ok(())
    }
}
