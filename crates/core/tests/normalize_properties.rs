use proptest::prelude::*;
use finops_core::{normalize, Dataset, SourceRecord};

proptest! {
    #[test]
    fn normalize_is_deterministic(records in record_vec()) {
        for record in &records {
            let first = normalize(record).expect("normalize");
            let second = normalize(&record.clone()).expect("normalize");
            prop_assert_eq!(&first.text, &second.text);
            prop_assert_eq!(&first.hash, &second.hash);
        }
    }

    #[test]
    fn dataset_hash_is_stable(records in record_vec()) {
        let a = Dataset::new(records.clone()).expect("dataset");
        let b = Dataset::new(records).expect("dataset");
        prop_assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn whitespace_noise_does_not_change_hash(text in "[A-Za-z0-9]{1,12}( [A-Za-z0-9]{1,12}){0,6}") {
        let clean = SourceRecord::tip("t", text.clone());
        let noisy = SourceRecord::tip("t", format!("  {}\t ", text.replace(' ', "   ")));
        prop_assert_eq!(normalize(&clean).unwrap().hash, normalize(&noisy).unwrap().hash);
    }
}

fn record_vec() -> impl Strategy<Value = Vec<SourceRecord>> {
    prop::collection::vec(arb_record(), 1..20).prop_map(|records| {
        records
            .into_iter()
            .enumerate()
            .map(|(idx, mut record)| {
                record.id = format!("rec-{idx}");
                record
            })
            .collect()
    })
}

fn arb_record() -> impl Strategy<Value = SourceRecord> {
    (
        "[A-Za-z][A-Za-z0-9 .,%-]{2,40}",
        prop_oneof![
            Just("Compute Engine"),
            Just("BigQuery"),
            Just("Cloud Storage"),
        ],
        0u32..5000,
        "20[0-9]{2}-(0[1-9]|1[0-2])",
        any::<bool>(),
    )
        .prop_map(|(text, service, cost, month, is_tip)| {
            if is_tip {
                SourceRecord::tip("", text)
            } else {
                SourceRecord::row("", text)
                    .with_meta("service", service)
                    .with_meta("cost", cost)
                    .with_meta("month", month)
            }
        })
}
