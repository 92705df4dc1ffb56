use calib_core::serde::{from_json_slice, from_yaml_slice, to_canonical_json_bytes, to_yaml_string};
use calib_core::{FinalSamples, SampleSet, StatusPoint};

#[test]
fn sample_set_roundtrips_through_json() {
    let set = SampleSet::from_points(
        2,
        vec!["beta".into(), "gamma".into()],
        vec![vec![0.1, 0.2], vec![0.3, 0.4]],
    );
    let bytes = to_canonical_json_bytes(&set).unwrap();
    let back: SampleSet = from_json_slice(&bytes).unwrap();
    assert_eq!(back, set);
    assert!(back.validate().is_ok());
}

#[test]
fn canonical_json_is_key_ordered() {
    let value = serde_json::json!({"zeta": 1, "alpha": {"y": 2, "b": 3}});
    let bytes = to_canonical_json_bytes(&value).unwrap();
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        r#"{"alpha":{"b":3,"y":2},"zeta":1}"#
    );
}

#[test]
fn status_uses_snake_case_names() {
    let yaml = to_yaml_string(&StatusPoint::NextPoint).unwrap();
    assert_eq!(yaml.trim(), "next_point");
    let back: StatusPoint = from_yaml_slice(yaml.as_bytes()).unwrap();
    assert_eq!(back, StatusPoint::NextPoint);
}

#[test]
fn mismatched_dimension_is_rejected() {
    let set = SampleSet::from_points(0, vec!["x".into()], vec![vec![1.0, 2.0]]);
    assert!(set.validate().is_err());
}

#[test]
fn weighted_mean_uses_weights() {
    let samples = FinalSamples {
        param_names: vec!["x".into()],
        points: vec![vec![1.0], vec![3.0]],
        weights: vec![3.0, 1.0],
    };
    assert!((samples.weighted_mean()[0] - 1.5).abs() < 1e-12);
}
