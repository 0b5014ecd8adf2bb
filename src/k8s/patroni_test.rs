use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use maplit::btreemap;

use super::patroni::{member_is_running, parse_sync_standbys};
use crate::unit::Unit;

const APP: &str = "postgresql-k8s";

fn member_pod(status: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("postgresql-k8s-2".into()),
            annotations: status.map(|status| btreemap! {"status".to_string() => status.to_string()}),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn sync_standbys_are_parsed_in_priority_order() -> Result<()> {
    let units = parse_sync_standbys(APP, "postgresql-k8s-2, postgresql-k8s-0,postgresql-k8s-1")?;
    let expected = vec![Unit::new(APP, 2), Unit::new(APP, 0), Unit::new(APP, 1)];
    assert!(units == expected, "unexpected sync standbys, got {:?} expected {:?}", units, expected);

    let units = parse_sync_standbys(APP, "")?;
    assert!(units.is_empty(), "expected no sync standbys from empty annotation, got {:?}", units);
    Ok(())
}

#[test]
fn sync_standbys_reject_foreign_members() {
    let res = parse_sync_standbys(APP, "postgresql-k8s-1,other-1");
    assert!(res.is_err(), "expected error parsing a member of another app, got {:?}", res);
}

#[test]
fn member_is_running_reads_status_annotation() {
    let cases = [
        (Some(r#"{"state":"running","role":"replica","version":"2.1.4"}"#), true),
        (Some(r#"{"state":"starting","role":"replica"}"#), false),
        (Some(r#"{"role":"replica"}"#), false),
        (Some("not json"), false),
        (None, false),
    ];
    for (status, expected) in cases {
        let running = member_is_running(&member_pod(status));
        assert!(running == expected, "unexpected member state for status {:?}, got {} expected {}", status, running, expected);
    }
}
