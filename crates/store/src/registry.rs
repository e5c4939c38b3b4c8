//! Identity registry: IMEI -> vehicle -> owning tenant.

use fleetlock_contracts::{
    validate_display_name, validate_imei, validate_tenant_id, Vehicle,
};

use crate::{conflict_on_unique, vehicle_from_row, Store, StoreError};

const VEHICLE_COLUMNS: &str = "id, tenant_id, name, plate, imei, created_at";

impl Store {
    /// Registers a vehicle under `tenant_id`. Fails with `Conflict` if the
    /// IMEI is already registered to any tenant; the uniqueness check is the
    /// insert itself, not a prior read.
    pub async fn register_vehicle(
        &self,
        tenant_id: &str,
        name: &str,
        plate: Option<&str>,
        imei: &str,
    ) -> Result<Vehicle, StoreError> {
        validate_tenant_id(tenant_id).map_err(StoreError::InvalidArgument)?;
        validate_display_name(name).map_err(StoreError::InvalidArgument)?;
        validate_imei(imei).map_err(StoreError::InvalidArgument)?;

        let row = tokio::time::timeout(
            self.write_timeout(),
            sqlx::query(
                "INSERT INTO vehicles (tenant_id, name, plate, imei) VALUES (?1, ?2, ?3, ?4) \
                 RETURNING id, tenant_id, name, plate, imei, created_at",
            )
            .bind(tenant_id)
            .bind(name)
            .bind(plate)
            .bind(imei)
            .fetch_one(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(conflict_on_unique)?;

        let vehicle = vehicle_from_row(&row)?;
        tracing::info!(
            vehicle_id = vehicle.id,
            tenant_id = %vehicle.tenant_id,
            imei = %vehicle.imei,
            "registry.vehicle_registered"
        );
        Ok(vehicle)
    }

    /// Resolves a hardware identifier to its vehicle. `UnknownDevice` if no
    /// vehicle carries this IMEI.
    pub async fn resolve_imei(&self, imei: &str) -> Result<Vehicle, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE imei = ?1"
        ))
        .bind(imei)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => vehicle_from_row(&row),
            None => Err(StoreError::UnknownDevice),
        }
    }

    /// All vehicles owned by `tenant_id`, newest first.
    pub async fn list_vehicles(&self, tenant_id: &str) -> Result<Vec<Vehicle>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE tenant_id = ?1 ORDER BY id DESC"
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(vehicle_from_row).collect()
    }

    /// Removes an owned vehicle. Ownership check and delete are a single
    /// statement; position and command history is intentionally left in
    /// place and becomes unreachable through the ownership gate.
    pub async fn delete_vehicle(
        &self,
        tenant_id: &str,
        vehicle_id: i64,
    ) -> Result<(), StoreError> {
        let result = tokio::time::timeout(
            self.write_timeout(),
            sqlx::query("DELETE FROM vehicles WHERE id = ?1 AND tenant_id = ?2")
                .bind(vehicle_id)
                .bind(tenant_id)
                .execute(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        if result.rows_affected() == 0 {
            tracing::debug!(vehicle_id, "registry.delete: vehicle absent or foreign-owned");
            return Err(StoreError::NotAccessible);
        }

        tracing::info!(vehicle_id, tenant_id = %tenant_id, "registry.vehicle_deleted");
        Ok(())
    }
}
