use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::position::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub i64);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    EnRoute,
    Delivered,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::EnRoute => "en_route",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Failed => "failed",
        }
    }

    /// Every stored value that reads as this status, wire value first.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            OrderStatus::Pending => &["pending", "pendente"],
            OrderStatus::EnRoute => &["en_route", "em_rota"],
            OrderStatus::Delivered => &["delivered", "entregue", "concluido"],
            OrderStatus::Failed => &["failed", "falha", "cancelado", "nao_entregue"],
        }
    }

    /// Parses wire values and the legacy aliases older clients wrote.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_lowercase();
        [
            OrderStatus::Pending,
            OrderStatus::EnRoute,
            OrderStatus::Delivered,
            OrderStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.aliases().contains(&raw.as_str()))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::EnRoute)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Delivery,
    Pickup,
    Other,
}

impl ServiceKind {
    pub fn infer(text: &str) -> Option<Self> {
        let text = text.to_lowercase();
        if text.contains("recolha") || text.contains("coleta") || text.contains("pickup") {
            Some(ServiceKind::Pickup)
        } else if text.contains("entrega") || text.contains("delivery") {
            Some(ServiceKind::Delivery)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub driver_id: Option<DriverId>,
    pub customer: String,
    pub address: String,
    pub service: ServiceKind,
    pub status: OrderStatus,
    pub notes: Option<String>,
    pub instructions: Option<String>,
    pub receiver: Option<String>,
    pub destination: Option<GeoPoint>,
    pub route_order: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion: Option<GeoPoint>,
}

impl Order {
    /// Field-level merge: values carried by `fresher` win, absent values keep ours.
    pub fn merge_from(&mut self, fresher: &Order) {
        self.driver_id = fresher.driver_id.or(self.driver_id);
        if !fresher.customer.is_empty() {
            self.customer = fresher.customer.clone();
        }
        if !fresher.address.is_empty() {
            self.address = fresher.address.clone();
        }
        if fresher.service != ServiceKind::Other {
            self.service = fresher.service;
        }
        self.status = fresher.status;
        merge_opt(&mut self.notes, &fresher.notes);
        merge_opt(&mut self.instructions, &fresher.instructions);
        merge_opt(&mut self.receiver, &fresher.receiver);
        merge_opt(&mut self.destination, &fresher.destination);
        merge_opt(&mut self.route_order, &fresher.route_order);
        merge_opt(&mut self.completed_at, &fresher.completed_at);
        merge_opt(&mut self.completion, &fresher.completion);
    }
}

fn merge_opt<T: Clone>(ours: &mut Option<T>, theirs: &Option<T>) {
    if theirs.is_some() {
        *ours = theirs.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverCategory {
    Customer,
    Family,
    Neighbor,
    Doorman,
    Reception,
    Apartment,
    Condominium,
    Other,
}

impl ReceiverCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" => None,
            "customer" | "cliente" | "proprio" => Some(ReceiverCategory::Customer),
            "family" | "familiar" => Some(ReceiverCategory::Family),
            "neighbor" | "vizinho" => Some(ReceiverCategory::Neighbor),
            "doorman" | "porteiro" => Some(ReceiverCategory::Doorman),
            "reception" | "recepcao" => Some(ReceiverCategory::Reception),
            "apartment" | "apartamento" => Some(ReceiverCategory::Apartment),
            "condominium" | "condominio" => Some(ReceiverCategory::Condominium),
            _ => Some(ReceiverCategory::Other),
        }
    }

    /// Residence-unit categories need a unit number to be locatable.
    pub fn requires_unit(&self) -> bool {
        matches!(self, ReceiverCategory::Apartment | ReceiverCategory::Condominium)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReceiverCategory::Customer => "Customer",
            ReceiverCategory::Family => "Family",
            ReceiverCategory::Neighbor => "Neighbor",
            ReceiverCategory::Doorman => "Doorman",
            ReceiverCategory::Reception => "Reception",
            ReceiverCategory::Apartment => "Apartment",
            ReceiverCategory::Condominium => "Condominium",
            ReceiverCategory::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverInfo {
    pub category: ReceiverCategory,
    pub name: String,
    pub unit: Option<String>,
}

impl ReceiverInfo {
    pub fn display(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{}: {} (unit {})", self.category.label(), self.name, unit),
            None => format!("{}: {}", self.category.label(), self.name),
        }
    }
}
