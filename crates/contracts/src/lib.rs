use serde::{Deserialize, Serialize};

/// A lock or unlock instruction issued against a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Lock,
    Unlock,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Lock => "LOCK",
            CommandKind::Unlock => "UNLOCK",
        }
    }

    /// Case-insensitive; legacy clients send lowercase kinds.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOCK" => Some(CommandKind::Lock),
            "UNLOCK" => Some(CommandKind::Unlock),
            _ => None,
        }
    }
}

/// Command lifecycle status.
///
/// The only legal paths are `pending -> sent -> completed` and
/// `pending -> sent -> failed`, plus direct `pending -> completed/failed`
/// for commands the device agent gives up on before sending. A terminal
/// status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(CommandStatus::Pending),
            "sent" => Some(CommandStatus::Sent),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// Statuses a command may currently hold for a transition *into* `self`.
    /// Resubmitting the current status is handled separately as a no-op and
    /// is not listed here.
    pub fn accepted_from(self) -> &'static [CommandStatus] {
        match self {
            CommandStatus::Pending => &[],
            CommandStatus::Sent => &[CommandStatus::Pending],
            CommandStatus::Completed | CommandStatus::Failed => {
                &[CommandStatus::Pending, CommandStatus::Sent]
            }
        }
    }
}

/// A registered vehicle. `imei` is globally unique and immutable; it is the
/// only link between raw telemetry and a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    pub imei: String,
    pub created_at: String,
}

/// One geolocation sample. Ordered by the server-assigned `id`, never by a
/// device-claimed clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub id: i64,
    pub imei: String,
    pub recorded_at: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub vehicle_id: i64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: String,
}

pub const IMEI_MAX_LEN: usize = 32;
pub const NAME_MAX_LEN: usize = 120;
pub const REASON_MAX_LEN: usize = 500;

pub fn validate_tenant_id(tenant_id: &str) -> Result<(), &'static str> {
    if tenant_id.trim().is_empty() {
        return Err("tenant_id must not be empty");
    }
    Ok(())
}

pub fn validate_imei(imei: &str) -> Result<(), &'static str> {
    if imei.is_empty() {
        return Err("imei must not be empty");
    }
    if imei.len() > IMEI_MAX_LEN {
        return Err("imei is too long");
    }
    if !imei.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err("imei must be alphanumeric");
    }
    Ok(())
}

pub fn validate_display_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("name must not be empty");
    }
    if name.len() > NAME_MAX_LEN {
        return Err("name is too long");
    }
    Ok(())
}

pub fn validate_reason(reason: &str) -> Result<(), &'static str> {
    if reason.len() > REASON_MAX_LEN {
        return Err("reason is too long");
    }
    Ok(())
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), &'static str> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err("latitude must be a finite value in [-90, 90]");
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err("longitude must be a finite value in [-180, 180]");
    }
    Ok(())
}

pub fn validate_speed(speed: f64) -> Result<(), &'static str> {
    if !speed.is_finite() || speed < 0.0 {
        return Err("speed must be a finite non-negative value");
    }
    Ok(())
}
