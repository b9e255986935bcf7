//! Queue a few commands, a marker and a sync object on simulated hardware

use std::time::Duration;

use hwsched::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 hwsched Simple Submit Example");
    println!("================================\n");

    let gpu = SimHardware::new();
    let scheduler = Scheduler::new(SchedulerConfig::quick(), gpu.interfaces())?;

    let render = scheduler.create_context(ContextParams::default())?;
    let compute = scheduler.create_context(ContextParams {
        priority: 1,
        ..ContextParams::default()
    })?;
    println!("Created contexts {} (render) and {} (compute)", render, compute);

    // Three commands followed by a barrier
    let last = scheduler.queue_commands(
        render,
        vec![
            DrawRequest::Command(CommandRequest::with_ib_count(4)),
            DrawRequest::Command(CommandRequest::with_ib_count(2)),
            DrawRequest::Command(CommandRequest::with_ib_count(1)),
            DrawRequest::Marker,
        ],
        None,
    )?;
    println!("Render work queued up to timestamp {}", last);

    // Compute waits for the render barrier before its own command runs
    let ts = scheduler.queue_commands(
        compute,
        vec![
            DrawRequest::Sync(vec![SyncPoint::Timestamp {
                context: render,
                timestamp: last,
            }]),
            DrawRequest::Command(CommandRequest::with_ib_count(8)),
        ],
        None,
    )?;

    std::thread::sleep(Duration::from_millis(20));
    println!("\nSubmitted before the GPU finished anything:");
    for s in gpu.submissions() {
        println!("  • ctx {} ts {} {} ({} IBs)", s.context, s.timestamp, s.kind, s.ibs);
    }

    println!("\nCompleting render work...");
    gpu.set_auto_retire(true);
    gpu.complete_all();
    scheduler.kick();

    scheduler.wait_timestamp(compute, ts, Duration::from_secs(1))?;
    scheduler.wait_idle(Duration::from_secs(1))?;
    println!("✅ Compute timestamp {} retired", ts);

    let stats = scheduler.stats();
    println!("\n📊 {} submitted, {} retired", stats.submitted, stats.retired);

    Ok(())
}
