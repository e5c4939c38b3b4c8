//! Position store: append-only telemetry keyed by IMEI.

use fleetlock_contracts::{
    validate_coordinates, validate_imei, validate_speed, PositionSample,
};

use crate::{position_from_row, Store, StoreError};

/// Device-supplied fields of a telemetry sample. The id and timestamp are
/// server-assigned on insert.
#[derive(Debug, Clone)]
pub struct NewPosition<'a> {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub event: Option<&'a str>,
}

/// One page of samples plus the IMEI they were read under.
#[derive(Debug, Clone)]
pub struct PositionPage {
    pub imei: String,
    pub samples: Vec<PositionSample>,
}

const POSITION_COLUMNS: &str = "id, imei, recorded_at, latitude, longitude, speed, event";

impl Store {
    /// Appends a sample for a registered device. The registration check and
    /// the insert are one statement, so telemetry for an unregistered IMEI
    /// never creates a row (`UnknownDevice`).
    pub async fn append_position(
        &self,
        imei: &str,
        sample: &NewPosition<'_>,
    ) -> Result<PositionSample, StoreError> {
        validate_imei(imei).map_err(StoreError::InvalidArgument)?;
        validate_coordinates(sample.latitude, sample.longitude)
            .map_err(StoreError::InvalidArgument)?;
        let speed = sample.speed.unwrap_or(0.0);
        validate_speed(speed).map_err(StoreError::InvalidArgument)?;

        let row = tokio::time::timeout(
            self.write_timeout(),
            sqlx::query(&format!(
                "INSERT INTO positions (imei, latitude, longitude, speed, event) \
                 SELECT ?1, ?2, ?3, ?4, ?5 \
                 WHERE EXISTS (SELECT 1 FROM vehicles WHERE imei = ?1) \
                 RETURNING {POSITION_COLUMNS}"
            ))
            .bind(imei)
            .bind(sample.latitude)
            .bind(sample.longitude)
            .bind(speed)
            .bind(sample.event)
            .fetch_optional(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        match row {
            Some(row) => position_from_row(&row),
            None => Err(StoreError::UnknownDevice),
        }
    }

    /// Most-recent-first samples for an owned vehicle, strictly descending
    /// by server-assigned id.
    pub async fn query_positions(
        &self,
        tenant_id: &str,
        vehicle_id: i64,
        limit: u32,
    ) -> Result<PositionPage, StoreError> {
        let vehicle = self.assert_ownership(tenant_id, vehicle_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE imei = ?1 ORDER BY id DESC LIMIT ?2"
        ))
        .bind(&vehicle.imei)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        let samples = rows.iter().map(position_from_row).collect::<Result<_, _>>()?;
        Ok(PositionPage {
            imei: vehicle.imei,
            samples,
        })
    }
}
