//! Command ledger: append-only lock/unlock requests with a single-row
//! status state machine.

use fleetlock_contracts::{validate_reason, Command, CommandKind, CommandStatus};

use crate::{command_from_row, Store, StoreError};

const COMMAND_COLUMNS: &str = "id, vehicle_id, kind, status, reason, created_at";

impl Store {
    /// Records a lock/unlock request against an owned vehicle. New commands
    /// always start `pending`; a retry of a finished command is a new row,
    /// never a reopened one.
    pub async fn create_command(
        &self,
        tenant_id: &str,
        vehicle_id: i64,
        kind: CommandKind,
        reason: Option<&str>,
    ) -> Result<Command, StoreError> {
        if let Some(reason) = reason {
            validate_reason(reason).map_err(StoreError::InvalidArgument)?;
        }
        self.assert_ownership(tenant_id, vehicle_id).await?;

        let row = tokio::time::timeout(
            self.write_timeout(),
            sqlx::query(&format!(
                "INSERT INTO commands (vehicle_id, kind, status, reason) \
                 VALUES (?1, ?2, 'pending', ?3) \
                 RETURNING {COMMAND_COLUMNS}"
            ))
            .bind(vehicle_id)
            .bind(kind.as_str())
            .bind(reason)
            .fetch_one(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let command = command_from_row(&row)?;
        tracing::info!(
            command_id = command.id,
            vehicle_id,
            kind = command.kind.as_str(),
            "commands.created"
        );
        Ok(command)
    }

    /// Most-recent-first commands on vehicles owned by `tenant_id`,
    /// optionally narrowed to one owned vehicle. Commands whose vehicle has
    /// been deleted drop out of the join: orphaned history is retained but
    /// unreachable.
    pub async fn list_commands(
        &self,
        tenant_id: &str,
        vehicle_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Command>, StoreError> {
        let rows = match vehicle_id {
            Some(vehicle_id) => {
                self.assert_ownership(tenant_id, vehicle_id).await?;
                sqlx::query(&format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands \
                     WHERE vehicle_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))
                .bind(vehicle_id)
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT c.id, c.vehicle_id, c.kind, c.status, c.reason, c.created_at \
                     FROM commands c JOIN vehicles v ON v.id = c.vehicle_id \
                     WHERE v.tenant_id = ?1 ORDER BY c.id DESC LIMIT ?2",
                )
                .bind(tenant_id)
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.iter().map(command_from_row).collect()
    }

    /// Advances a command's status on behalf of the device-side agent.
    ///
    /// The update is a compare-and-set keyed by the current status, so
    /// concurrent agents serialize on the row. Resubmitting the status a
    /// command already holds is a no-op that returns the unchanged command;
    /// device-side delivery retries after a network timeout rely on this.
    pub async fn transition_command(
        &self,
        command_id: i64,
        new_status: CommandStatus,
    ) -> Result<Command, StoreError> {
        let sources = new_status.accepted_from();

        let updated = if sources.is_empty() {
            // Nothing transitions back into this status; only the
            // idempotent-resubmission path below can succeed.
            None
        } else {
            let src_a = sources[0];
            let src_b = sources.last().copied().unwrap_or(src_a);
            tokio::time::timeout(
                self.write_timeout(),
                sqlx::query(&format!(
                    "UPDATE commands SET status = ?1 \
                     WHERE id = ?2 AND status IN (?3, ?4) \
                     RETURNING {COMMAND_COLUMNS}"
                ))
                .bind(new_status.as_str())
                .bind(command_id)
                .bind(src_a.as_str())
                .bind(src_b.as_str())
                .fetch_optional(self.pool()),
            )
            .await
            .map_err(|_| StoreError::Timeout)??
        };

        if let Some(row) = updated {
            let command = command_from_row(&row)?;
            tracing::info!(
                command_id,
                status = command.status.as_str(),
                "commands.transitioned"
            );
            return Ok(command);
        }

        // The CAS matched nothing: unknown id, idempotent resubmission, or
        // an illegal transition. A fresh read tells them apart.
        let current = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"
        ))
        .bind(command_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = current else {
            return Err(StoreError::CommandNotFound);
        };

        let command = command_from_row(&row)?;
        if command.status == new_status {
            return Ok(command);
        }
        Err(StoreError::InvalidTransition)
    }
}
