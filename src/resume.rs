//! Resume engine: replays the durable placement snapshot into the
//! relocation bus and the shards-affected map at the start of a
//! generation.
//!
//! Phase A walks the shard list, phase B strictly afterwards replays
//! persisted data moves, and phase C schedules the best-effort tombstone
//! sweep in the background.

use crate::bus::RelocationSender;
use crate::config::{DatabaseConfig, DistributorKnobs};
use crate::error::{DistributorError, Result};
use crate::gateway::DurableGateway;
use crate::ids::{MoveId, ServerId};
use crate::initial::InitialDistribution;
use crate::keyspace::{Key, KeyRange};
use crate::physical::PhysicalShardCollection;
use crate::shard::{MoveReason, RelocateShard};
use crate::shards_affected::{ShardsAffectedMap, Team};
use crate::util::TaskGroup;
use log::{debug, info, warn};
use std::sync::Arc;

pub struct ResumeContext {
    pub knobs: Arc<DistributorKnobs>,
    pub config: DatabaseConfig,
    pub shards_affected: Arc<ShardsAffectedMap>,
    pub physical: Option<Arc<PhysicalShardCollection>>,
    pub output: RelocationSender,
    pub gateway: Arc<DurableGateway>,
    pub background: TaskGroup,
}

/// Replays shards, then data moves, then schedules the tombstone sweep.
pub async fn resume_relocations(ctx: &ResumeContext, initial: &InitialDistribution) -> Result<()> {
    resume_from_shards(ctx, initial).await?;
    resume_from_data_moves(ctx, initial).await?;
    schedule_tombstone_sweep(ctx, initial);
    Ok(())
}

fn shard_teams(ctx: &ResumeContext, primary_src: &[ServerId], remote_src: &[ServerId]) -> Vec<Team> {
    let mut teams = vec![Team::primary(primary_src.to_vec())];
    if ctx.config.multi_region() {
        teams.push(Team::remote(remote_src.to_vec()));
    }
    teams
}

async fn resume_from_shards(ctx: &ResumeContext, initial: &InitialDistribution) -> Result<()> {
    // All physical shards must be seeded before any move is issued.
    if let Some(physical) = &ctx.physical {
        if ctx.knobs.shard_encode_location_metadata && ctx.knobs.enable_physical_shard {
            for window in initial.shards.windows(2) {
                let shard = &window[0];
                let range = KeyRange::new(shard.key.clone(), window[1].key.clone());
                physical.init_shard(
                    shard.src_id,
                    range,
                    shard_teams(ctx, &shard.primary_src, &shard.remote_src),
                );
            }
        }
    }

    let mut boundaries: Vec<Key> = Vec::new();
    for range_override in &initial.range_overrides {
        boundaries.push(range_override.range.begin.clone());
        boundaries.push(range_override.range.end.clone());
        debug!(
            "event=resume_custom_range range={} replicas={:?}",
            range_override.range, range_override.replication_factor
        );
    }
    boundaries.sort();
    boundaries.dedup();

    let large_teams = ctx.knobs.large_teams_enabled();
    let mut over_replicated = 0usize;
    let mut emitted = 0u64;
    for window in initial.shards.windows(2) {
        let shard = &window[0];
        let range = KeyRange::new(shard.key.clone(), window[1].key.clone());
        let teams = shard_teams(ctx, &shard.primary_src, &shard.remote_src);

        for (index, sub_range) in range.split_at(&boundaries).into_iter().enumerate() {
            ctx.shards_affected.define_shard(sub_range.clone());

            let override_replicas = initial
                .override_containing(&sub_range.begin)
                .and_then(|o| o.replication_factor)
                .unwrap_or(0);
            let custom_replicas = ctx.config.storage_team_size.max(override_replicas);

            let mut unhealthy = shard.primary_src.len() != custom_replicas;
            if !unhealthy && ctx.config.multi_region() {
                unhealthy = shard.remote_src.len() != custom_replicas;
            }
            if !unhealthy && shard.primary_src.len() > ctx.config.storage_team_size {
                over_replicated += 1;
                if over_replicated > ctx.knobs.max_shards_on_large_teams {
                    unhealthy = true;
                }
            }

            ctx.shards_affected.move_shard(&sub_range, teams.clone());

            // An in-flight pre-destination move is rescheduled rather than
            // tracked directly; the queue will pick it up at low priority.
            let recover_inflight = shard.has_dest && shard.dest_id.is_anonymous();
            if (large_teams && (unhealthy || index > 0)) || recover_inflight {
                let reason = if unhealthy {
                    MoveReason::TeamUnhealthy
                } else if index > 0 {
                    MoveReason::SplitShard
                } else {
                    MoveReason::RecoverMove
                };
                ctx.output.send(RelocateShard::new(sub_range, reason))?;
                emitted += 1;
            }
        }

        tokio::task::yield_now().await;
    }
    info!(
        "event=resume_from_shards_done shards={} relocations={} over_replicated={}",
        initial.shard_count(),
        emitted,
        over_replicated
    );
    Ok(())
}

async fn resume_from_data_moves(ctx: &ResumeContext, initial: &InitialDistribution) -> Result<()> {
    for (entry_range, data_move) in &initial.data_moves {
        let meta = &data_move.meta;
        if meta.ranges.is_empty() {
            info!("event=resume_empty_data_move move_id={}", meta.id);
            continue;
        }
        if data_move.cancelled
            || (data_move.valid && !ctx.knobs.shard_encode_location_metadata)
        {
            let mut relocation =
                RelocateShard::new(meta.ranges[0].clone(), MoveReason::RecoverMove);
            relocation.data_move_id = meta.id;
            relocation.cancelled = true;
            ctx.output.send(relocation)?;
            info!("event=resume_cancel_data_move move_id={} range={}", meta.id, meta.ranges[0]);
        } else if data_move.valid {
            if meta.ranges[0] != *entry_range {
                return Err(DistributorError::internal(format!(
                    "data move {} range {} does not match map entry {entry_range}",
                    meta.id, meta.ranges[0]
                )));
            }
            let mut relocation =
                RelocateShard::new(meta.ranges[0].clone(), MoveReason::RecoverMove);
            relocation.data_move_id = meta.id;
            relocation.data_move = Some(data_move.clone());

            let mut teams = vec![Team::primary(data_move.primary_dest.clone())];
            if !data_move.remote_dest.is_empty() {
                teams.push(Team::remote(data_move.remote_dest.clone()));
            }

            // A data move may span previously merged shards; re-establish
            // the tracked unit before registering the destination teams so
            // team failures are captured from the start.
            ctx.shards_affected.request_tracker_restart(relocation.keys.clone());
            ctx.shards_affected.define_shard(relocation.keys.clone());
            ctx.shards_affected.move_shard(&relocation.keys, teams);
            ctx.output.send(relocation)?;
            debug!("event=resume_restore_data_move move_id={} range={}", meta.id, meta.ranges[0]);
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

fn schedule_tombstone_sweep(ctx: &ResumeContext, initial: &InitialDistribution) {
    if initial.tombstones_to_clean.is_empty() {
        return;
    }
    let gateway = ctx.gateway.clone();
    let tombstones = initial.tombstones_to_clean.clone();
    let batch = ctx.knobs.tombstone_clear_batch.max(1);
    ctx.background.spawn(async move {
        sweep_tombstones(gateway, tombstones, batch).await;
    });
}

/// Clears finished data-move tombstones in bounded batches. Failures are
/// logged and swallowed; the distributor need not restart over a sweep.
async fn sweep_tombstones(gateway: Arc<DurableGateway>, tombstones: Vec<MoveId>, batch: usize) {
    let total = tombstones.len();
    let mut cleared = 0usize;
    for chunk in tombstones.chunks(batch) {
        match gateway.clear_data_moves(chunk.to_vec()).await {
            Ok(()) => cleared += chunk.len(),
            Err(err) => {
                warn!(
                    "event=tombstone_sweep_failed cleared={cleared} total={total} error={err}"
                );
                return;
            }
        }
    }
    debug!("event=tombstone_sweep_done cleared={cleared}");
}
