use std::time::Duration;

use tempfile::TempDir;

use telco_xml_tables::{
    CounterLayout, CounterTableWriter, ExtractionPipeline, FlattenError, MemoryStorage, NaturalKeyOptions,
    OutputFormat, PipelineOptions, RunOutcome, SchemaFingerprint, SinkRouter, StorageBackend,
};

use crate::common::{TestFixtures, pattern, read_csv, strings};

const NEDN: &str =
    "DC=a1.companyNN.com,SubNetwork=1,IRPAgent=1,SubNetwork=CountryNN,MeContext=MEC-Gbg1,ManagedElement=RNC-Gbg-1";
const METRICS: [&str; 4] = [
    "attTCHSeizures",
    "succTCHSeizures",
    "attImmediateAssignProcs",
    "succImmediateAssignProcs",
];

fn csv_pipeline(
    storage: &MemoryStorage,
    glob: String,
    layout: CounterLayout,
) -> ExtractionPipeline<MemoryStorage> {
    let mut options = PipelineOptions::new(glob);
    options.channel_capacity = 1;
    options.poll_interval = Duration::from_millis(10);
    let router = SinkRouter::new(storage.clone(), OutputFormat::Csv);
    ExtractionPipeline::new(options, CounterTableWriter::new(router, layout))
}

fn assert_all_closed(storage: &MemoryStorage) {
    let closed = storage.closed_keys().unwrap();
    for key in storage.list("").unwrap() {
        assert!(closed.contains(&key), "{} was not closed", key);
    }
}

#[tokio::test]
async fn test_files_with_same_metrics_share_one_sink() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml", "mdc_c3_2.xml", "meas_c4_1.xml"]);
    let storage = MemoryStorage::new();

    let report = csv_pipeline(&storage, pattern(input.path(), "mdc*.xml"), CounterLayout::Plain)
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.files.len(), 2);
    assert!(report.files[0].path.ends_with("mdc_c3_1.xml"));
    assert!(report.files[1].path.ends_with("mdc_c3_2.xml"));
    assert_eq!(report.items, 2);
    assert_eq!(report.rows, 6);
    assert_eq!(report.files[0].metadata.get("ffv"), Some("32.401 V5.0"));
    assert_eq!(report.files[0].metadata.get("ts"), Some("20210301141430"));

    let fingerprint = SchemaFingerprint::of(&METRICS);
    assert_eq!(fingerprint.as_str(), "9995823c30bcf308b91ab0b66313e86a");
    let key = format!("UtranCell-900-{}.csv", fingerprint);
    assert_eq!(storage.list("").unwrap(), vec![key.clone()]);

    let (header, rows) = read_csv(&storage, &key);
    let mut expected_header = strings(&["ST", "NEDN", "LDN"]);
    expected_header.extend(strings(&METRICS));
    assert_eq!(header, expected_header);
    assert_eq!(rows.len(), 6);
    assert_eq!(
        rows[0],
        strings(&[
            "20210301141500",
            NEDN,
            "RncFunction=RF-1,UtranCell=Gbg-997",
            "234",
            "345",
            "567",
            "789",
        ])
    );
    assert_eq!(rows[2][2], "RncFunction=RF-1,UtranCell=Gbg-999");
    assert_eq!(rows[3][0], "20210301143000");
    assert_all_closed(&storage);
}

#[tokio::test]
async fn test_natural_key_layout_splits_distinguished_names() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml"]);
    let storage = MemoryStorage::new();

    let report = csv_pipeline(
        &storage,
        pattern(input.path(), "mdc*.xml"),
        CounterLayout::NaturalKey(NaturalKeyOptions::default()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.sinks.len(), 1);
    assert_eq!(
        report.sinks[0].name,
        "UtranCell-900-5ff3d8a40d18614e53848f10f7a233c7.csv"
    );
    let (header, rows) = read_csv(&storage, &report.sinks[0].name);
    assert_eq!(header.len(), 1 + 8 + 4);
    assert_eq!(&header[..4], &strings(&["ST", "DC", "SubNetwork", "IRPAgent"])[..]);
    assert_eq!(
        rows[1],
        strings(&[
            "20210301141500",
            "a1.companyNN.com",
            "1",
            "1",
            "CountryNN",
            "MEC-Gbg1",
            "RNC-Gbg-1",
            "RF-1",
            "Gbg-998",
            "890",
            "901",
            "123",
            "234",
        ])
    );
}

#[tokio::test]
async fn test_natural_key_options() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml"]);

    let storage = MemoryStorage::new();
    let options = NaturalKeyOptions {
        nedn_ignore_before: Some("SubNetwork".to_string()),
        ..NaturalKeyOptions::default()
    };
    let report = csv_pipeline(&storage, pattern(input.path(), "*.xml"), CounterLayout::NaturalKey(options))
        .run()
        .await
        .unwrap();
    assert_eq!(
        report.sinks[0].name,
        "UtranCell-900-ef8cafe693802c8e82481c808313c4c4.csv"
    );

    let storage = MemoryStorage::new();
    let options = NaturalKeyOptions {
        node_key: Some("ManagedElement".to_string()),
        ..NaturalKeyOptions::default()
    };
    let report = csv_pipeline(&storage, pattern(input.path(), "*.xml"), CounterLayout::NaturalKey(options))
        .run()
        .await
        .unwrap();
    assert_eq!(
        report.sinks[0].name,
        "UtranCell-900-fa16cbe3427a4deba29f16abbb2a0afb.csv"
    );
    let (header, rows) = read_csv(&storage, &report.sinks[0].name);
    assert_eq!(&header[..4], &strings(&["ST", "Node", "RncFunction", "UtranCell"])[..]);
    assert_eq!(&rows[0][..4], &strings(&["20210301141500", "RNC-Gbg-1", "RF-1", "Gbg-997"])[..]);

    let storage = MemoryStorage::new();
    let options = NaturalKeyOptions {
        node_key: Some("BscFunction".to_string()),
        ..NaturalKeyOptions::default()
    };
    let result = csv_pipeline(&storage, pattern(input.path(), "*.xml"), CounterLayout::NaturalKey(options))
        .run()
        .await;
    assert!(matches!(result, Err(FlattenError::StructuralViolation { .. })));
    assert_all_closed(&storage);
}

#[tokio::test]
async fn test_meas_collec_file() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["meas_c4_1.xml"]);
    let storage = MemoryStorage::new();

    let report = csv_pipeline(&storage, pattern(input.path(), "meas*.xml"), CounterLayout::Plain)
        .run()
        .await
        .unwrap();

    assert_eq!(report.items, 2);
    assert_eq!(report.rows, 4);
    let metadata = &report.files[0].metadata;
    assert_eq!(metadata.get("fileFormatVersion"), Some("32.435 V10.0"));
    assert_eq!(metadata.get("elementType"), Some("RNC"));

    let cells = format!("UtranCell-900-{}.csv", SchemaFingerprint::of(&METRICS));
    let (_, rows) = read_csv(&storage, &cells);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][0], "2000-03-01T14:14:30+02:00");
    assert_eq!(rows[0][1], NEDN);

    let handover = format!(
        "RncHandOver-900-{}.csv",
        SchemaFingerprint::of(&["attHoSucc", "succHoSucc"])
    );
    let (header, rows) = read_csv(&storage, &handover);
    assert_eq!(header, strings(&["ST", "NEDN", "LDN", "attHoSucc", "succHoSucc"]));
    assert_eq!(
        rows,
        vec![strings(&[
            "2000-03-01T14:14:30+02:00",
            NEDN,
            "RncFunction=RF-1,RncHandOver=HO-1",
            "11",
            "7",
        ])]
    );
}

async fn first_sink_opened(storage: MemoryStorage) {
    while storage.list("").map(|keys| keys.is_empty()).unwrap_or(true) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_cancel_mid_run_flushes_and_closes_open_sinks() {
    let fixtures = TestFixtures::new();
    let input = TempDir::new().unwrap();
    for index in 0..200 {
        std::fs::copy(
            fixtures.path("mdc_c3_1.xml"),
            input.path().join(format!("mdc_{:03}.xml", index)),
        )
        .unwrap();
    }
    let storage = MemoryStorage::new();

    let report = csv_pipeline(&storage, pattern(input.path(), "mdc*.xml"), CounterLayout::Plain)
        .run_until(first_sink_opened(storage.clone()))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.items >= 1);
    assert!(report.items < 200);
    assert!(report.files.len() < 200);

    let keys = storage.list("").unwrap();
    assert_eq!(keys, vec![format!("UtranCell-900-{}.csv", SchemaFingerprint::of(&METRICS))]);
    assert_eq!(keys, storage.closed_keys().unwrap());
    let (header, rows) = read_csv(&storage, &keys[0]);
    assert_eq!(header[0], "ST");
    assert_eq!(rows.len() as u64, report.rows);
}

#[tokio::test]
async fn test_no_matching_files() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["meas_c4_1.xml"]);
    let storage = MemoryStorage::new();

    let report = csv_pipeline(&storage, pattern(input.path(), "mdc*.xml"), CounterLayout::Plain)
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.files.is_empty());
    assert!(report.sinks.is_empty());
    assert!(storage.list("").unwrap().is_empty());
}
