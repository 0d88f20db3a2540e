use common::{Link, Simulation, init_logger};
use ezk_tfrc::compute_initial_rate;

mod common;

const MS: u64 = 1000;

#[test]
fn slow_start_grows_rate() {
    init_logger();

    let mut sim = Simulation::new(Link::new(25 * MS, 500_000, 50_000), 1000);
    let initial_rate = compute_initial_rate(1460, 50 * MS);
    let mut max_rate = 0;

    for now in (0..1000 * MS).step_by(MS as usize) {
        sim.step(now);
        max_rate = max_rate.max(sim.sender.send_rate());
    }

    assert!(
        max_rate > initial_rate * 3 / 2,
        "max_rate={max_rate} initial_rate={initial_rate}"
    );
}

#[test]
fn bottleneck_causes_loss_and_bounded_rate() {
    init_logger();

    let capacity = 100_000;
    let mut sim = Simulation::new(Link::new(25 * MS, capacity, 10_000), 1000);

    let mut samples = vec![];

    for now in (0..20_000 * MS).step_by(MS as usize) {
        sim.step(now);

        if now >= 10_000 * MS && now % (100 * MS) == 0 {
            samples.push(u64::from(sim.sender.send_rate()));
        }
    }

    assert!(sim.link.dropped > 0);
    assert!(sim.max_loss_event_rate > 0.0);
    assert!(sim.max_loss_event_rate <= 1.0);

    let average = samples.iter().sum::<u64>() / samples.len() as u64;

    assert!(average > capacity / 50, "average={average}");
    assert!(average < capacity * 3, "average={average}");
}
