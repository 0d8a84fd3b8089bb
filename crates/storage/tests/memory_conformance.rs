use intake_storage::conformance::run_conformance_suite;
use intake_storage::MemoryStorage;

#[tokio::test]
async fn memory_storage_passes_conformance() {
    let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
    assert!(report.total > 0);
    assert!(report.failed == 0, "{report}");
}
