//! Authorization gate: every tenant-scoped read or command goes through
//! `assert_ownership` first.

use fleetlock_contracts::Vehicle;

use crate::{vehicle_from_row, Store, StoreError};

impl Store {
    /// Verifies that `tenant_id` owns `vehicle_id` at the instant of the
    /// call (no caching) and returns the vehicle row.
    ///
    /// A missing vehicle and a vehicle owned by someone else are logged
    /// distinctly but surface as the same `NotAccessible` value, so a caller
    /// probing foreign ids cannot enumerate other tenants' hardware.
    pub async fn assert_ownership(
        &self,
        tenant_id: &str,
        vehicle_id: i64,
    ) -> Result<Vehicle, StoreError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, plate, imei, created_at FROM vehicles WHERE id = ?1",
        )
        .bind(vehicle_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            tracing::debug!(vehicle_id, "access.denied: vehicle does not exist");
            return Err(StoreError::NotAccessible);
        };

        let vehicle = vehicle_from_row(&row)?;
        if vehicle.tenant_id != tenant_id {
            tracing::debug!(
                vehicle_id,
                tenant_id = %tenant_id,
                "access.denied: vehicle owned by another tenant"
            );
            return Err(StoreError::NotAccessible);
        }

        Ok(vehicle)
    }
}
