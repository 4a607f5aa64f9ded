use paper_harvest::naming::{
    DEFAULT_PARTITION, artifact_file_name, partition_name, safe_identity, sanitize_for_dirname,
};
use paper_harvest::store::OutputStore;

use camino::Utf8PathBuf;

#[test]
fn old_style_identity_stays_in_its_partition() {
    let store = OutputStore::new(Utf8PathBuf::from("/out"));
    let path = store.partition_dir("cat_math.AG").join(artifact_file_name("math/0211159v1"));
    assert_eq!(path, Utf8PathBuf::from("/out/cat_math.AG/math_0211159v1.pdf"));
    assert_eq!(artifact_file_name("2101.00001v3"), "2101.00001v3.pdf");
}

#[test]
fn same_facets_same_partition() {
    for _ in 0..3 {
        assert_eq!(
            partition_name(Some("diffusion models"), Some("cs.CV"), Some("x_20230101_000000.json")),
            "kw_diffusion_models_cat_cs.CV"
        );
    }
}

#[test]
fn blank_facets_fall_back_in_order() {
    assert_eq!(
        partition_name(Some("   "), Some("***"), Some("/tmp/robotics_search_20240512_101500.json")),
        "robotics_search"
    );
    assert_eq!(partition_name(None, None, Some("_20240512_101500.json")), DEFAULT_PARTITION);
}

#[test]
fn category_and_seed_lengths_are_capped() {
    let long_category = "c".repeat(40);
    assert_eq!(partition_name(None, Some(&long_category), None), format!("cat_{}", "c".repeat(25)));

    let seed = format!("{}.json", "s".repeat(90));
    assert_eq!(partition_name(None, None, Some(&seed)).len(), 60);
}

#[test]
fn sanitize_keeps_dots_and_dashes() {
    assert_eq!(sanitize_for_dirname("q-bio.NC / neurons", 0), "q-bio.NC_neurons");
    assert_eq!(safe_identity(r"odd\id/v1"), "odd_id_v1");
}
