use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use secret_committee::bls::Keypair;
use secret_committee::committee::Validator;
use secret_committee::dkg::{DealBundle, DistKeyGenerator, DkgConfig, ResponseBundle};
use std::time::Duration;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

fn committee(n: usize) -> (Vec<Keypair>, Vec<Validator>) {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let keys: Vec<Keypair> = (0..n).map(|_| Keypair::generate(&mut rng)).collect();
    let nodes = keys
        .iter()
        .enumerate()
        .map(|(i, k)| Validator {
            node_id: i as u64,
            validator_key: k.public(),
            p2p_key: k.public(),
        })
        .collect();
    (keys, nodes)
}

fn generators(keys: &[Keypair], nodes: &[Validator]) -> Vec<DistKeyGenerator> {
    keys.iter()
        .map(|k| DistKeyGenerator::new(DkgConfig::fresh(k.clone(), nodes.to_vec(), 1)).expect("generator"))
        .collect()
}

fn deals(gens: &[DistKeyGenerator]) -> Vec<DealBundle> {
    #[cfg(feature = "parallel")]
    let bundles = gens
        .par_iter()
        .map(|g| g.deal_bundle().expect("deal").expect("dealer"))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let bundles = gens
        .iter()
        .map(|g| g.deal_bundle().expect("deal").expect("dealer"))
        .collect();

    bundles
}

fn responses(gens: &mut [DistKeyGenerator], bundles: &[DealBundle]) -> Vec<ResponseBundle> {
    gens.iter_mut()
        .map(|g| g.process_deals(bundles).expect("process_deals"))
        .collect()
}

fn bench_dkg_steps(c: &mut Criterion) {
    // Keep defaults modest so stage benches complete quickly.
    let (keys, nodes) = committee(16);

    let mut group = c.benchmark_group("dkg_stages_n16_t10");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    group.bench_function("stage1_deal_bundles", |b| {
        b.iter_batched(
            || generators(&keys, &nodes),
            |gens| {
                let _bundles = deals(&gens);
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("stage2_process_deals", |b| {
        b.iter_batched(
            || {
                let gens = generators(&keys, &nodes);
                let bundles = deals(&gens);
                (gens, bundles)
            },
            |(mut gens, bundles)| {
                let _ = gens[0].process_deals(&bundles).expect("process_deals");
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("stage3_process_responses", |b| {
        b.iter_batched(
            || {
                let mut gens = generators(&keys, &nodes);
                let bundles = deals(&gens);
                let resps = responses(&mut gens, &bundles);
                (gens, resps)
            },
            |(gens, resps)| {
                let _ = gens[0].process_responses(&resps).expect("process_responses");
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_dkg_steps);
criterion_main!(benches);
