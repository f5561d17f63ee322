use std::fs::File;
use std::path::Path;
use std::time::Duration;

use arrow::array::{Array, StringArray, UInt64Array};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tempfile::TempDir;
use telco_xml_tables::{
    CounterLayout, CounterTableWriter, ExtractionPipeline, LocalStorage, NaturalKeyOptions, OutputFormat,
    PipelineOptions, StorageBackend,
};

use crate::common::{TestFixtures, pattern};

const PLAIN_FINGERPRINT: &str = "9995823c30bcf308b91ab0b66313e86a";
const NODE_FINGERPRINT: &str = "9250b00755cdcfa28421b7ddb6f76666";

async fn run_parquet(input: &Path, out: &Path, layout: CounterLayout) -> LocalStorage {
    let storage = LocalStorage::new(out);
    let mut options = PipelineOptions::new(pattern(input, "mdc*.xml"));
    options.poll_interval = Duration::from_millis(10);
    let router = telco_xml_tables::SinkRouter::new(storage.clone(), OutputFormat::Parquet);
    ExtractionPipeline::new(options, CounterTableWriter::new(router, layout))
        .run()
        .await
        .unwrap();
    storage
}

fn read_batches(path: &Path) -> Vec<RecordBatch> {
    let file = File::open(path).unwrap();
    ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap())
        .collect()
}

#[tokio::test]
async fn test_plain_layout_partitions_by_time() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml", "mdc_c3_2.xml"]);
    let out = TempDir::new().unwrap();

    let storage = run_parquet(input.path(), out.path(), CounterLayout::Plain).await;

    assert_eq!(
        storage.list("").unwrap(),
        vec![
            format!("UtranCell-900/2021-03-01/14/15/part-{}-mdc_c3_1-0.parquet", PLAIN_FINGERPRINT),
            format!("UtranCell-900/2021-03-01/14/30/part-{}-mdc_c3_2-0.parquet", PLAIN_FINGERPRINT),
            format!("UtranCell-900/_schema-{}.parquet", PLAIN_FINGERPRINT),
        ]
    );

    let schema_only = read_batches(&out.path().join(format!("UtranCell-900/_schema-{}.parquet", PLAIN_FINGERPRINT)));
    assert_eq!(schema_only.iter().map(RecordBatch::num_rows).sum::<usize>(), 0);

    let batches = read_batches(&out.path().join(format!(
        "UtranCell-900/2021-03-01/14/15/part-{}-mdc_c3_1-0.parquet",
        PLAIN_FINGERPRINT
    )));
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.num_rows(), 3);

    let schema = batch.schema();
    let names: Vec<&str> = schema.fields().iter().map(|field| field.name().as_str()).collect();
    assert_eq!(
        names,
        vec![
            "NEDN",
            "LDN",
            "attTCHSeizures",
            "succTCHSeizures",
            "attImmediateAssignProcs",
            "succImmediateAssignProcs",
        ]
    );
    assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
    assert_eq!(schema.field(2).data_type(), &DataType::UInt64);

    let ldn = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(ldn.value(2), "RncFunction=RF-1,UtranCell=Gbg-999");
    let seizures = batch.column(2).as_any().downcast_ref::<UInt64Array>().unwrap();
    assert_eq!(seizures.values().to_vec(), vec![234, 890, 456]);
    assert_eq!(seizures.null_count(), 0);
}

#[tokio::test]
async fn test_partition_by_node() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml"]);
    let out = TempDir::new().unwrap();
    let layout = CounterLayout::NaturalKey(NaturalKeyOptions {
        node_key: Some("ManagedElement".to_string()),
        partition_by_node: true,
        ..NaturalKeyOptions::default()
    });

    let storage = run_parquet(input.path(), out.path(), layout).await;

    let part = format!(
        "UtranCell-Node-900/RNC-Gbg-1/2021-03-01/14/15/part-{}-mdc_c3_1-0.parquet",
        NODE_FINGERPRINT
    );
    assert_eq!(
        storage.list("").unwrap(),
        vec![
            part.clone(),
            format!("UtranCell-Node-900/_schema-{}.parquet", NODE_FINGERPRINT),
        ]
    );

    let batches = read_batches(&out.path().join(&part));
    let schema = batches[0].schema();
    let names: Vec<&str> = schema.fields().iter().map(|field| field.name().as_str()).collect();
    assert_eq!(&names[..2], &["RncFunction", "UtranCell"]);
    let cells = batches[0].column(1).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(cells.value(0), "Gbg-997");
}

#[tokio::test]
async fn test_rerun_overwrites_same_parts() {
    let fixtures = TestFixtures::new();
    let input = fixtures.stage(&["mdc_c3_1.xml"]);
    let out = TempDir::new().unwrap();

    let first = run_parquet(input.path(), out.path(), CounterLayout::Plain).await;
    let keys = first.list("").unwrap();
    let second = run_parquet(input.path(), out.path(), CounterLayout::Plain).await;

    assert_eq!(second.list("").unwrap(), keys);
}
