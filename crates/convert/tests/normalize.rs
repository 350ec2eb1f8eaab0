#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodSpec};
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta};
use stencil_convert::{
    coerce, coerce_to, default_scheme, from_typed, gvk_for, objects_to_generic, parse_fragment, parse_many, split_documents, to_bytes,
};
use stencil_core::{ConvertError, TemplateInstance, TemplateInstanceSpec};

fn pod(name: &str, ns: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta { name: Some(name.to_string()), namespace: ns.map(|s| s.to_string()), ..Default::default() },
        spec: Some(PodSpec::default()),
        ..Default::default()
    }
}

fn identity(obj: &DynamicObject) -> (String, String, Option<String>, Option<String>) {
    let (api_version, kind) = obj.types.as_ref().map(|t| (t.api_version.clone(), t.kind.clone())).unwrap_or_default();
    (api_version, kind, obj.metadata.name.clone(), obj.metadata.namespace.clone())
}

#[test]
fn split_counts_only_non_empty_documents() {
    let doc = |n: usize| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-{n}\ndata:\n  k: v\n");
    // 3 real documents, 3 empty ones (leading, middle, trailing)
    let text = format!("\n---\n{}---\n{}---\n---\n{}---\n", doc(1), doc(2), doc(3));
    assert_eq!(split_documents(&text).len(), 3);
    let (objs, err) = parse_many(&text);
    assert!(err.is_none(), "unexpected error: {:?}", err);
    let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
    assert_eq!(names, vec!["cm-1", "cm-2", "cm-3"]);
}

#[test]
fn parse_of_bytes_preserves_identity() {
    let samples = vec![
        from_typed(&pod("web", Some("test"))).unwrap(),
        from_typed(&pod("cluster-less", None)).unwrap(),
        parse_fragment(b"apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: reader\nrules: []\n").unwrap(),
        parse_fragment(br#"{"apiVersion":"example.com/v1","kind":"Widget","metadata":{"name":"w","namespace":"a"},"spec":{"size":3}}"#).unwrap(),
    ];
    for obj in samples {
        let back = parse_fragment(&to_bytes(&obj).unwrap()).unwrap();
        assert_eq!(identity(&back), identity(&obj));
        assert_eq!(back.data, obj.data);
    }
}

#[test]
fn typed_objects_normalize_like_text() {
    let typed = objects_to_generic(&[pod("a", None), pod("b", Some("x"))]).unwrap();
    let (text, err) = parse_many("apiVersion: v1\nkind: Pod\nmetadata:\n  name: a\nspec: {}\n");
    assert!(err.is_none());
    assert_eq!(typed.len(), 2);
    assert_eq!(identity(&typed[0]), identity(&text[0]));
    assert_eq!(typed[1].metadata.namespace.as_deref(), Some("x"));
}

#[test]
fn objects_to_generic_accepts_json_values() {
    let values = vec![serde_json::json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "svc" }, "spec": { "ports": [ { "port": 80 } ] } })];
    let objs = objects_to_generic(&values).unwrap();
    assert_eq!(objs[0].data["spec"]["ports"][0]["port"], 80);
}

#[test]
fn coerce_into_registered_kinds() {
    let scheme = default_scheme();
    let obj = from_typed(&pod("web", Some("test"))).unwrap();
    let typed = coerce(&obj, &gvk_for::<Pod>(), &scheme).unwrap();
    assert_eq!(typed.gvk(), gvk_for::<Pod>());
    let p: Pod = coerce_to(&obj, &scheme).unwrap();
    assert_eq!(p.metadata.name.as_deref(), Some("web"));

    let mut ti = TemplateInstance::new("inst", TemplateInstanceSpec { template: "tmpl".into(), parameters: vec![] });
    ti.metadata.namespace = Some("test".into());
    let generic = from_typed(&ti).unwrap();
    let back: TemplateInstance = coerce_to(&generic, &scheme).unwrap();
    assert_eq!(back.spec.template, "tmpl");
    assert_eq!(back.metadata.namespace.as_deref(), Some("test"));
}

#[test]
fn coerce_reports_unknown_and_mismatched_kinds() {
    let scheme = default_scheme();
    let widget = GroupVersionKind::gvk("example.com", "v1", "Widget");
    let obj = from_typed(&pod("web", None)).unwrap();
    assert_eq!(coerce(&obj, &widget, &scheme).unwrap_err(), ConvertError::UnknownKind("example.com/v1/Widget".into()));

    match coerce_to::<ConfigMap>(&obj, &scheme) {
        Err(ConvertError::Decode { kind, message }) => {
            assert_eq!(kind, "v1/ConfigMap");
            assert!(message.contains("v1/Pod"), "message={}", message);
        }
        other => panic!("expected decode error, got {:?}", other.map(|_| ())),
    }

    // Right kind, wrong shape
    let bad = parse_fragment(b"apiVersion: v1\nkind: Pod\nmetadata:\n  name: bad\nspec:\n  containers: 7\n").unwrap();
    assert!(matches!(coerce(&bad, &gvk_for::<Pod>(), &scheme), Err(ConvertError::Decode { .. })));
}
