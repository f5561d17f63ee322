use tempfile::TempDir;
use telco_xml_tables::{
    ElementFilter, FlattenError, LocalStorage, MemoryStorage, SchemaFingerprint, StorageBackend,
    XmlEventReader, bulkcm,
};

use crate::common::{TestFixtures, read_csv, strings};

const MANAGED_ELEMENT: &str = "ManagedElement-2ce5d8fae91842f854b00844e05fdd6b.csv";
const MANAGEMENT_NODE: &str = "ManagementNode-cb742e095d2f7bda9622720bf9237682.csv";
const SUBNETWORK: &str = "SubNetwork-7c3cf0dd0368151b3df3dea6e9ec46ff.csv";
const UTRAN_CELL: &str = "vsDataUtranCell-762627b0939d1ac04dadef2b58f194c1.csv";

#[test]
fn test_subnetwork_managementnode_managedelement_scenario() {
    let fixtures = TestFixtures::new();
    let out = TempDir::new().unwrap();
    let storage = LocalStorage::new(out.path());

    let report = bulkcm::parse_file(&fixtures.bulkcm(), storage.clone(), ElementFilter::default()).unwrap();

    assert_eq!(report.sinks.len(), 3);
    assert_eq!(
        storage.list("").unwrap(),
        vec![
            MANAGED_ELEMENT.to_string(),
            MANAGEMENT_NODE.to_string(),
            SUBNETWORK.to_string(),
            "bulkcm_metadata.json".to_string(),
        ]
    );

    let (header, rows) = read_csv(&storage, MANAGED_ELEMENT);
    assert_eq!(
        header,
        strings(&[
            "SubNetwork",
            "ManagedElement",
            "managedElementType",
            "userLabel",
            "vendorName",
            "userDefinedState",
            "locationName",
        ])
    );
    assert_eq!(
        rows,
        vec![
            strings(&["1", "1", "RNC", "Paris RN1", "Company NN", "commercial", "Champ de Mars"]),
            strings(&["1", "2", "RNC", "Paris RN2", "Company NN", "commercial", "Concorde"]),
        ]
    );

    let (header, rows) = read_csv(&storage, MANAGEMENT_NODE);
    assert_eq!(
        header,
        strings(&[
            "SubNetwork",
            "ManagementNode",
            "userLabel",
            "vendorName",
            "userDefinedState",
            "locationName",
        ])
    );
    assert_eq!(
        rows,
        vec![strings(&["1", "1", "Paris MN1", "Company NN", "commercial", "Montparnasse"])]
    );

    let (header, rows) = read_csv(&storage, SUBNETWORK);
    assert_eq!(header, strings(&["SubNetwork", "userLabel", "userDefinedNetworkType"]));
    assert_eq!(rows, vec![strings(&["1", "Paris SN1", "UMTS"])]);
}

#[test]
fn test_metadata_side_car() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();

    let report = bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), storage.clone(), ElementFilter::default())
        .unwrap();

    assert_eq!(report.metadata_key, "bulkcm_with_utrancell_metadata.json");
    assert_eq!(report.metadata.get("fileFormatVersion"), Some("32.615 V4.0"));
    assert_eq!(
        report.metadata.get("senderName"),
        Some("DC=a1.companyNN.com,SubNetwork=1,IRPAgent=1")
    );
    assert_eq!(report.metadata.get("dateTime"), Some("2001-05-07T12:00:00+02:00"));
    assert_eq!(report.metadata.namespaces.len(), 3);

    let json: serde_json::Value =
        serde_json::from_slice(&storage.read(&report.metadata_key).unwrap()).unwrap();
    assert_eq!(json["attributes"]["vendorName"], "Company NN");
    assert_eq!(
        json["namespaces"]["xmlns:un"],
        "http://www.3gpp.org/ftp/specs/archive/32_series/32.645#utranNrm"
    );
}

#[test]
fn test_virtual_containers_resolve_to_their_data_type() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();

    let report = bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), storage.clone(), ElementFilter::default())
        .unwrap();

    let types: Vec<&str> = report.sinks.iter().map(|sink| sink.type_name.as_str()).collect();
    assert!(types.contains(&"vsDataUtranCell"));
    assert!(types.contains(&"vsDataRncHandOver"));
    assert!(!types.contains(&"VsDataContainer"));

    let handover = SchemaFingerprint::of(&[
        "SubNetwork",
        "ManagedElement",
        "RncFunction",
        "vsDataRncHandOver",
        "abcMin",
        "abcMax",
    ]);
    let (_, rows) = read_csv(&storage, &format!("vsDataRncHandOver-{}.csv", handover));
    assert_eq!(rows, vec![strings(&["1", "2", "3", "HO1", "12", "34"])]);

    // SubNetwork has no attribute block and is emitted at its own close
    let subnetwork = SchemaFingerprint::of(&["SubNetwork"]);
    assert_eq!(subnetwork.as_str(), "97cdbf39c39074db55f07d505908bc4c");
    let (header, rows) = read_csv(&storage, &format!("SubNetwork-{}.csv", subnetwork));
    assert_eq!(header, strings(&["SubNetwork"]));
    assert_eq!(rows, vec![strings(&["1"])]);
}

#[test]
fn test_attribute_names_with_same_concatenation_stay_apart() {
    let xml = r#"<bulkCmConfigDataFile>
  <configData dnPrefix="DC=a1.companyNN.com">
    <SubNetwork id="1">
      <ManagedElement id="1">
        <attributes><ab>X</ab><c>Y</c></attributes>
      </ManagedElement>
      <ManagedElement id="2">
        <attributes><a>P</a><bc>Q</bc></attributes>
      </ManagedElement>
    </SubNetwork>
  </configData>
</bulkCmConfigDataFile>"#;
    let storage = MemoryStorage::new();

    let report = bulkcm::parse_reader(
        XmlEventReader::new(xml.as_bytes(), "colliding.xml"),
        storage.clone(),
        ElementFilter::default(),
    )
    .unwrap();

    let fingerprint = SchemaFingerprint::of(&["SubNetwork", "ManagedElement", "ab", "c"]);
    assert_eq!(
        fingerprint,
        SchemaFingerprint::of(&["SubNetwork", "ManagedElement", "a", "bc"])
    );
    let elements: Vec<&str> = report
        .sinks
        .iter()
        .filter(|sink| sink.type_name == "ManagedElement")
        .map(|sink| sink.name.as_str())
        .collect();
    assert_eq!(elements.len(), 2);

    let (header, rows) = read_csv(&storage, &format!("ManagedElement-{}.csv", fingerprint));
    assert_eq!(header, strings(&["SubNetwork", "ManagedElement", "ab", "c"]));
    assert_eq!(rows, vec![strings(&["1", "1", "X", "Y"])]);

    let (header, rows) = read_csv(&storage, &format!("ManagedElement-{}-1.csv", fingerprint));
    assert_eq!(header, strings(&["SubNetwork", "ManagedElement", "a", "bc"]));
    assert_eq!(rows, vec![strings(&["1", "2", "P", "Q"])]);
}

#[test]
fn test_exclude_everything() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();
    let filter = ElementFilter::new::<&str>(&[], &["*"]);

    let report = bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), storage.clone(), filter).unwrap();

    assert!(report.sinks.is_empty());
    assert_eq!(report.stats.emitted, 0);
    assert_eq!(report.stats.filtered, 5);
    assert_eq!(
        storage.list("").unwrap(),
        vec!["bulkcm_with_utrancell_metadata.json".to_string()]
    );
}

#[test]
fn test_exclude_everything_except_included_type() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();
    let filter = ElementFilter::new(&["vsDataUtranCell"], &["*"]);

    let report = bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), storage.clone(), filter).unwrap();

    assert_eq!(report.sinks.len(), 1);
    assert_eq!(report.sinks[0].name, UTRAN_CELL);
    let (header, rows) = read_csv(&storage, UTRAN_CELL);
    assert_eq!(
        header,
        strings(&[
            "SubNetwork",
            "ManagedElement",
            "RncFunction",
            "vsDataUtranCell",
            "sc",
            "pcpichpower",
        ])
    );
    assert_eq!(rows, vec![strings(&["1", "2", "3", "Cell4", "111", "222"])]);
}

#[test]
fn test_rerun_into_empty_target_is_identical() {
    let fixtures = TestFixtures::new();
    let first = MemoryStorage::new();
    let second = MemoryStorage::new();

    bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), first.clone(), ElementFilter::default()).unwrap();
    bulkcm::parse_file(&fixtures.bulkcm_with_utrancell(), second.clone(), ElementFilter::default()).unwrap();

    let keys = first.list("").unwrap();
    assert_eq!(keys, second.list("").unwrap());
    for key in keys {
        assert_eq!(first.read(&key).unwrap(), second.read(&key).unwrap(), "{} differs", key);
    }
}

#[test]
fn test_rerun_into_same_target_appends_without_header() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();

    bulkcm::parse_file(&fixtures.bulkcm(), storage.clone(), ElementFilter::default()).unwrap();
    bulkcm::parse_file(&fixtures.bulkcm(), storage.clone(), ElementFilter::default()).unwrap();

    let (header, rows) = read_csv(&storage, MANAGED_ELEMENT);
    assert_eq!(header[0], "SubNetwork");
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2][1], "1");
}

#[test]
fn test_tag_mismatch_keeps_position() {
    let fixtures = TestFixtures::new();
    let storage = MemoryStorage::new();

    let error = bulkcm::parse_file(&fixtures.tag_mismatch(), storage, ElementFilter::default()).unwrap_err();

    match &error {
        FlattenError::MalformedInput { file, line, .. } => {
            assert!(file.ends_with("tag_mismatch.xml"));
            assert_eq!(*line, 15);
        }
        other => panic!("Expected MalformedInput, got {:?}", other),
    }
    let message = error.to_string();
    assert!(message.contains("line 15"), "{}", message);
    assert!(message.contains("tag_mismatch.xml"), "{}", message);
}

#[test]
fn test_empty_document_is_malformed() {
    let fixtures = TestFixtures::new();
    let result = bulkcm::parse_file(&fixtures.bulkcm_empty(), MemoryStorage::new(), ElementFilter::default());
    assert!(matches!(result, Err(FlattenError::MalformedInput { .. })));
}

#[test]
fn test_missing_input() {
    let fixtures = TestFixtures::new();
    let result = bulkcm::parse_file(&fixtures.path("absent.xml"), MemoryStorage::new(), ElementFilter::default());
    assert!(matches!(result, Err(FlattenError::MissingResource { .. })));
}

#[test]
fn test_probe_fixture() {
    let fixtures = TestFixtures::new();

    let report = bulkcm::probe(&fixtures.bulkcm()).unwrap();

    assert_eq!(report.config_data.len(), 1);
    let config_data = &report.config_data[0];
    assert_eq!(config_data.dn_prefix.as_deref(), Some("DC=a1.companyNN.com"));
    assert_eq!(config_data.subnetworks.len(), 1);
    assert_eq!(config_data.subnetworks[0].id, "1");
    assert_eq!(config_data.subnetworks[0].management_nodes, 1);
    assert_eq!(config_data.subnetworks[0].managed_elements, 2);
    assert_eq!(report.metadata.get("vendorName"), Some("Company NN"));

    let result = bulkcm::probe(&fixtures.tag_mismatch());
    assert!(matches!(result, Err(FlattenError::MalformedInput { .. })));
}
