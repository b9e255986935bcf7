//! Inject a page fault and watch the scheduler recover

use std::time::Duration;

use hwsched::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("💥 hwsched Fault Recovery Example");
    println!("=================================\n");

    let gpu = SimHardware::new();
    let scheduler = Scheduler::new(SchedulerConfig::quick(), gpu.interfaces())?;

    let good = scheduler.create_context(ContextParams::default())?;
    let bad = scheduler.create_context(ContextParams {
        priority: 0,
        flags: ContextFlags::INVALIDATE_ON_FAULT,
    })?;

    for ctx in [good, bad] {
        scheduler.queue_commands(
            ctx,
            vec![
                DrawRequest::Command(CommandRequest::with_ib_count(2)),
                DrawRequest::Command(CommandRequest::with_ib_count(2)),
            ],
            None,
        )?;
    }
    std::thread::sleep(Duration::from_millis(20));
    println!("Inflight before the fault: {}", scheduler.inflight());

    println!("Reporting page fault on ctx {} ts 1", bad);
    scheduler.report_fault(FaultReport::for_object(FaultCause::PAGE_FAULT, bad, 1));
    std::thread::sleep(Duration::from_millis(20));

    gpu.set_auto_retire(true);
    gpu.complete_all();
    scheduler.kick();
    scheduler.wait_idle(Duration::from_secs(1))?;

    match scheduler.queue_commands(bad, vec![DrawRequest::Command(CommandRequest::with_ib_count(1))], None) {
        Err(SchedError::ContextInvalid(id)) => println!("✅ ctx {} was invalidated", id),
        other => println!("❌ unexpected result: {:?}", other),
    }

    let ts = scheduler.queue_commands(good, vec![DrawRequest::Command(CommandRequest::with_ib_count(1))], None)?;
    scheduler.wait_timestamp(good, ts, Duration::from_secs(1))?;
    println!("✅ ctx {} kept working (ts {})", good, ts);

    println!("\n📊 Recovery history:");
    for record in scheduler.stats().fault_history {
        println!(
            "  • {:?}: reset={} replayed={} dropped={} invalidated={:?}",
            record.cause, record.reset, record.replayed, record.dropped, record.invalidated
        );
    }
    println!("Resets performed: {}", gpu.reset_count());

    Ok(())
}
