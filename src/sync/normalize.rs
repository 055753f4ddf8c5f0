//! Turns loose backend rows into typed models.
//!
//! Different writers have used different column names over time. The alias
//! tables below are the only place that knows about them: the first name in
//! each list is the column this crate writes, the rest are accepted on read.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::backend::Row;
use crate::models::order::{DriverId, Order, OrderId, OrderStatus, ServiceKind};
use crate::models::position::{DriverPosition, GeoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    DriverId,
    Customer,
    Address,
    ServiceType,
    Status,
    Notes,
    Instructions,
    Receiver,
    Lat,
    Lng,
    RouteOrder,
    CompletedAt,
    CompletionLat,
    CompletionLng,
    SignaturePath,
}

pub const ORDER_FIELDS: &[(Field, &[&str])] = &[
    (Field::Id, &["id"]),
    (Field::DriverId, &["driver_id", "motorista_id"]),
    (Field::Customer, &["customer", "cliente", "nome", "nome_cliente", "customer_name"]),
    (Field::Address, &["address", "endereco", "endereco_completo"]),
    (Field::ServiceType, &["service_type", "tipo", "tipo_servico"]),
    (Field::Status, &["status"]),
    (Field::Notes, &["notes", "observacoes", "motivo_nao_entrega"]),
    (Field::Instructions, &["instructions", "instrucao"]),
    (Field::Receiver, &["receiver", "recebedor"]),
    (Field::Lat, &["lat", "latitude"]),
    (Field::Lng, &["lng", "longitude"]),
    (Field::RouteOrder, &["route_order", "ordem_rota", "ordem"]),
    (Field::CompletedAt, &["completed_at", "concluded_at", "horario_conclusao"]),
    (Field::CompletionLat, &["completion_lat", "lat_conclusao"]),
    (Field::CompletionLng, &["completion_lng", "lng_conclusao"]),
    (Field::SignaturePath, &["signature_path", "assinatura"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverField {
    Id,
    Name,
    Lat,
    Lng,
    Heading,
    LastSignal,
}

pub const DRIVER_FIELDS: &[(DriverField, &[&str])] = &[
    (DriverField::Id, &["id"]),
    (DriverField::Name, &["name", "nome"]),
    (DriverField::Lat, &["lat", "latitude"]),
    (DriverField::Lng, &["lng", "longitude"]),
    (DriverField::Heading, &["heading"]),
    (DriverField::LastSignal, &["last_signal", "ultimo_sinal"]),
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("row has no usable id")]
    MissingId,

    #[error("unknown status {0:?}")]
    UnknownStatus(String),
}

/// The column this crate writes for `field`.
pub fn column(field: Field) -> &'static str {
    sources(ORDER_FIELDS, field)
        .first()
        .copied()
        .unwrap_or("id")
}

/// Every column `field` may be read from, write column first.
pub fn columns(field: Field) -> &'static [&'static str] {
    sources(ORDER_FIELDS, field)
}

pub fn driver_column(field: DriverField) -> &'static str {
    sources(DRIVER_FIELDS, field)
        .first()
        .copied()
        .unwrap_or("id")
}

fn sources<F: PartialEq + Copy>(table: &'static [(F, &'static [&'static str])], field: F) -> &'static [&'static str] {
    table
        .iter()
        .find(|(candidate, _)| *candidate == field)
        .map(|(_, names)| *names)
        .unwrap_or(&[])
}

/// First candidate column that carries a meaningful value.
fn lookup<'a, F: PartialEq + Copy>(
    table: &'static [(F, &'static [&'static str])],
    row: &'a Row,
    field: F,
) -> Option<&'a Value> {
    sources(table, field).iter().find_map(|name| {
        row.get(*name).filter(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    })
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        _ => None,
    }
}

fn point(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
        _ => None,
    }
}

/// Driver that owns the row, if the row names one.
pub fn driver_of(row: &Row) -> Option<DriverId> {
    lookup(ORDER_FIELDS, row, Field::DriverId)
        .and_then(as_i64)
        .map(DriverId)
}

pub fn order_id_of(row: &Row) -> Option<OrderId> {
    lookup(ORDER_FIELDS, row, Field::Id).and_then(as_i64).map(OrderId)
}

/// Normalizes an order row. A row without a status is treated as pending.
pub fn normalize_order(row: &Row) -> Result<Order, NormalizeError> {
    let text = |field| lookup(ORDER_FIELDS, row, field).and_then(as_text);
    let number = |field| lookup(ORDER_FIELDS, row, field).and_then(as_f64);

    let id = order_id_of(row).ok_or(NormalizeError::MissingId)?;

    let status = match text(Field::Status) {
        Some(raw) => OrderStatus::parse(&raw).ok_or(NormalizeError::UnknownStatus(raw))?,
        None => OrderStatus::Pending,
    };

    let customer = text(Field::Customer).unwrap_or_default();
    let notes = text(Field::Notes);

    let service = [text(Field::ServiceType), Some(customer.clone()), notes.clone()]
        .iter()
        .flatten()
        .find_map(|candidate| ServiceKind::infer(candidate))
        .unwrap_or(ServiceKind::Other);

    Ok(Order {
        id,
        driver_id: driver_of(row),
        customer,
        address: text(Field::Address).unwrap_or_default(),
        service,
        status,
        notes,
        instructions: text(Field::Instructions),
        receiver: text(Field::Receiver),
        destination: point(number(Field::Lat), number(Field::Lng)),
        route_order: lookup(ORDER_FIELDS, row, Field::RouteOrder).and_then(as_i64),
        completed_at: lookup(ORDER_FIELDS, row, Field::CompletedAt).and_then(as_timestamp),
        completion: point(number(Field::CompletionLat), number(Field::CompletionLng)),
    })
}

pub fn normalize_position(row: &Row) -> Result<DriverPosition, NormalizeError> {
    let get = |field| lookup(DRIVER_FIELDS, row, field);

    let driver_id = get(DriverField::Id)
        .and_then(as_i64)
        .map(DriverId)
        .ok_or(NormalizeError::MissingId)?;

    Ok(DriverPosition {
        driver_id,
        name: get(DriverField::Name).and_then(as_text),
        point: point(
            get(DriverField::Lat).and_then(as_f64),
            get(DriverField::Lng).and_then(as_f64),
        ),
        heading: get(DriverField::Heading).and_then(as_f64),
        last_signal: get(DriverField::LastSignal).and_then(as_timestamp),
    })
}
