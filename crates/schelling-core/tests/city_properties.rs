use proptest::prelude::*;
use schelling_core::{
    Cell, City, CityError, CityGrid, CitySnapshot, GroupId, Round, SchellingConfig, Simulation,
};

fn scenario_config() -> SchellingConfig {
    SchellingConfig {
        population_size: 100,
        empty_ratio: 0.1,
        similarity_threshold: 0.5,
        num_iterations: 10,
        rng_seed: Some(0x5EED),
        ..SchellingConfig::default()
    }
}

#[test]
fn hundred_house_scenario_preserves_population() {
    let snapshots = Simulation::new(scenario_config())
        .expect("simulation")
        .run()
        .expect("run");

    assert_eq!(snapshots.len(), 11);
    for (idx, snapshot) in snapshots.iter().enumerate() {
        assert_eq!(snapshot.round, Round(idx as u64));
        assert_eq!(snapshot.grid.rows(), 10);
        assert_eq!(snapshot.grid.cols(), 10);
        assert_eq!(snapshot.grid.occupied_count(), 90);
        assert_eq!(snapshot.grid.empty_count(), 10);
        assert_eq!(snapshot.grid.group_counts(), vec![45, 45]);
    }
}

#[test]
fn seeded_runs_are_identical() {
    let config = SchellingConfig {
        population_size: 900,
        num_iterations: 12,
        rng_seed: Some(0xDEAD_BEEF),
        ..SchellingConfig::default()
    };
    let first = Simulation::new(config.clone()).expect("a").run().expect("run a");
    let second = Simulation::new(config).expect("b").run().expect("run b");
    assert_eq!(first, second);
}

#[test]
fn different_seeds_produce_different_layouts() {
    let layout = |seed| {
        City::new(SchellingConfig {
            rng_seed: Some(seed),
            ..scenario_config()
        })
        .expect("city")
        .into_grid()
    };
    assert_ne!(layout(1), layout(2));
}

#[test]
fn zero_threshold_never_relocates() {
    let config = SchellingConfig {
        similarity_threshold: 0.0,
        num_iterations: 8,
        ..scenario_config()
    };
    let snapshots = Simulation::new(config).expect("sim").run().expect("run");
    let initial = &snapshots[0].grid;
    assert!(snapshots.iter().all(|snapshot| &snapshot.grid == initial));
}

#[test]
fn full_threshold_churns_mixed_layouts() {
    let config = SchellingConfig {
        population_size: 400,
        empty_ratio: 0.2,
        similarity_threshold: 1.0,
        num_iterations: 5,
        rng_seed: Some(99),
        ..SchellingConfig::default()
    };
    let mut city = City::new(config).expect("city");
    let occupied = city.grid().occupied_count();
    let vacancies = city.grid().empty_count();
    for _ in 0..5 {
        let summary = city.step().expect("step");
        assert!(summary.dissatisfied > occupied / 2);
        assert_eq!(summary.relocated, vacancies.min(summary.dissatisfied));
        assert_eq!(summary.deferred, summary.dissatisfied - summary.relocated);
    }
}

#[test]
fn invalid_empty_ratio_fails_before_building() {
    let config = SchellingConfig {
        empty_ratio: 1.5,
        ..scenario_config()
    };
    assert!(matches!(
        Simulation::new(config.clone()),
        Err(CityError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        City::new(config),
        Err(CityError::InvalidConfiguration(_))
    ));
}

#[test]
fn snapshots_are_detached_from_the_live_grid() {
    let mut city = City::new(SchellingConfig {
        similarity_threshold: 0.9,
        ..scenario_config()
    })
    .expect("city");
    let before = city.snapshot();
    let copy = before.clone();
    let summary = city.step().expect("step");
    assert!(summary.relocated > 0);
    assert_eq!(before, copy);
    assert_ne!(before.grid, *city.grid());
}

#[test]
fn rounds_can_be_restarted() {
    let simulation = Simulation::new(scenario_config()).expect("sim");
    let mut first = simulation.rounds().expect("first");
    let head: Vec<CitySnapshot> = first
        .by_ref()
        .take(3)
        .collect::<Result<_, _>>()
        .expect("head");
    let replay: Vec<CitySnapshot> = simulation
        .rounds()
        .expect("replay")
        .take(3)
        .collect::<Result<_, _>>()
        .expect("replay head");
    assert_eq!(head, replay);
    assert_eq!(first.city().round(), Round(2));
}

#[test]
fn snapshot_serializes_for_renderers() {
    let grid: CityGrid = "a.\n.b".parse().expect("grid");
    let city = City::with_grid(scenario_config(), grid).expect("city");
    let json = serde_json::to_value(city.snapshot()).expect("json");
    assert_eq!(json["round"], 0);
    assert_eq!(json["grid"]["rows"], 2);
    assert_eq!(json["grid"]["cells"][0]["Occupied"], 0);
    assert_eq!(json["grid"]["cells"][1], "Empty");
    assert_eq!(
        city.snapshot().to_matrix()[1][1],
        Cell::Occupied(GroupId(1))
    );
}

proptest! {
    #[test]
    fn population_is_conserved(
        seed in any::<u64>(),
        population in 16_usize..400,
        empty_ratio in 0.05_f64..0.6,
        threshold in 0.0_f64..=1.0,
        groups in 2_usize..5,
        iterations in 1_u32..6,
    ) {
        let config = SchellingConfig {
            population_size: population,
            empty_ratio,
            similarity_threshold: threshold,
            num_iterations: iterations,
            rng_seed: Some(seed),
            ..SchellingConfig::default()
        }
        .with_equal_groups(groups);

        let snapshots = Simulation::new(config).expect("sim").run().expect("run");
        prop_assert_eq!(snapshots.len(), iterations as usize + 1);

        let initial = &snapshots[0].grid;
        for snapshot in &snapshots {
            prop_assert_eq!(snapshot.grid.occupied_count(), initial.occupied_count());
            prop_assert_eq!(snapshot.grid.empty_count(), initial.empty_count());
            prop_assert_eq!(snapshot.grid.group_counts(), initial.group_counts());
            prop_assert_eq!(
                snapshot.grid.occupied_count() + snapshot.grid.empty_count(),
                snapshot.grid.len()
            );
        }
    }

    #[test]
    fn seeded_sequences_replay(seed in 1_u64..10_000, iterations in 1_u32..8) {
        let config = SchellingConfig {
            population_size: 225,
            num_iterations: iterations,
            rng_seed: Some(seed),
            ..SchellingConfig::default()
        };
        let a = Simulation::new(config.clone()).expect("a").run().expect("run a");
        let b = Simulation::new(config).expect("b").run().expect("run b");
        prop_assert_eq!(a, b);
    }

    #[test]
    fn isolated_agents_stay_satisfied(
        threshold in 0.0_f64..=1.0,
        row in 0_usize..5,
        col in 0_usize..5,
    ) {
        let mut cells = vec![Cell::Empty; 25];
        cells[row * 5 + col] = Cell::Occupied(GroupId(0));
        let grid = CityGrid::from_cells(5, 5, cells).expect("grid");
        prop_assert!(grid.is_satisfied(row, col, 1, threshold));
        prop_assert_eq!(grid.similarity_ratio(row, col, 1), None);
    }
}
