use clap::Parser;
use lib_cfdp::{ActionType, GenericActionRequest, PduProvenance, ShutdownInterrupt};
use project_tests::{Observer, pdu, start_processor, test_config};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Pushes actions and PDUs through an in-process processor and reports rates", long_about = None)]
struct Args {
    /// Concurrent action producers
    #[clap(short, long, default_value_t = 4)]
    producers: usize,

    /// Actions per producer
    #[clap(short, long, default_value_t = 2_000)]
    actions: usize,

    /// Inbound PDUs published from a blocking thread
    #[clap(long, default_value_t = 100_000)]
    pdus: usize,

    /// Action and inbound ring size (power of two)
    #[clap(long, default_value_t = 1024)]
    ring_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let dir = tempfile::tempdir()?;

    let mut config = test_config(dir.path());
    config.action_ring_buffer_size = args.ring_size;
    config.inbound_pdu_ring_buffer_size = args.ring_size;
    config.engine_cycle_minimum_interval_when_idle_millis = 1;

    let observer = Observer::new();
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client()?;
    let publisher = processor.inbound_pdu_publisher()?;

    let started = Instant::now();

    let pdu_count = args.pdus;
    let pdu_task = tokio::task::spawn_blocking(move || {
        let body = pdu(&[0xAB; 64]);
        let mut failed = 0usize;
        for _ in 0..pdu_count {
            if publisher.publish(&body, PduProvenance::default()).is_err() {
                failed += 1;
            }
        }
        failed
    });

    let mut producers = Vec::with_capacity(args.producers);
    for _ in 0..args.producers {
        let client = client.clone();
        let actions = args.actions;
        producers.push(tokio::spawn(async move {
            let mut failed = 0usize;
            for _ in 0..actions {
                let request = GenericActionRequest {
                    action: ActionType::ResetStat,
                };
                match client.generic_action(request).await {
                    Ok(result) if result.is_success() => {}
                    _ => failed += 1,
                }
            }
            failed
        }));
    }

    let mut failed_actions = 0;
    for producer in producers {
        failed_actions += producer.await?;
    }
    let failed_pdus = pdu_task.await?;
    let elapsed = started.elapsed();

    // Let the cycler catch up with the PDUs still in the ring.
    let deadline = Instant::now() + Duration::from_secs(10);
    while observer.pdu_count() + failed_pdus < args.pdus && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let total_actions = args.producers * args.actions;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("\n----- Dispatch Throughput -----");
    println!("Elapsed: {:.3} s", secs);
    println!(
        "Actions: {} ({} failed), {:.0} actions/s",
        total_actions,
        failed_actions,
        total_actions as f64 / secs
    );
    println!(
        "PDUs: {} published ({} failed), {} consumed, {:.0} PDUs/s",
        args.pdus,
        failed_pdus,
        observer.pdu_count(),
        args.pdus as f64 / secs
    );
    println!("Engine cycles: {}", observer.cycles());
    println!("-------------------------------\n");

    let report = tokio::task::spawn_blocking(move || processor.shutdown(&ShutdownInterrupt::new())).await?;
    println!("Shutdown clean: {}", report.is_clean());
    Ok(())
}
