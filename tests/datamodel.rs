use std::io::Cursor;
use std::time::Duration;

use dmxmodel::{
    Angle, Binary, Color, Datamodel, DeferredMode, DmError, Element, ElementArray, Matrix4, Quaternion, Value, Vector2, Vector3,
    Vector4,
};
use uuid::Uuid;

const TOLERANCE: f32 = 1e-5;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() <= TOLERANCE
}

fn approx_all(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| approx(*x, *y))
}

/// Build the kitchen-sink model: every scalar kind under its kind name and
/// a length-2 array of the same value under "<kind> array".
fn populate() -> (Datamodel, Uuid) {
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();

    let blob = Binary::new((0u8..16).collect());
    let blue = Color::new(0, 0, 255, 255);
    let v2 = Vector2::new(1.0, 2.0);
    let v3 = Vector3::new(1.0, 2.0, 3.0);
    let ang = Angle::new(1.0, 2.0, 3.0);
    let v4 = Vector4::new(1.0, 2.0, 3.0, 4.0);
    let quat = Quaternion::new(1.0, 2.0, 3.0, 4.0).normalised();
    let mat = Matrix4::from_floats((0..16).map(|i| i as f32)).unwrap();

    dm.set(root, "int", 1).unwrap();
    dm.set(root, "int array", vec![1, 1]).unwrap();
    dm.set(root, "float", 1.5f32).unwrap();
    dm.set(root, "float array", vec![1.5f32, 1.5]).unwrap();
    dm.set(root, "bool", true).unwrap();
    dm.set(root, "bool array", vec![true, true]).unwrap();
    dm.set(root, "binary", blob.clone()).unwrap();
    dm.set(root, "binary array", vec![blob.clone(), blob]).unwrap();
    dm.set(root, "time", Duration::from_secs(300)).unwrap();
    dm.set(root, "time array", vec![Duration::from_secs(300), Duration::from_secs(300)]).unwrap();
    dm.set(root, "color", blue).unwrap();
    dm.set(root, "color array", vec![blue, blue]).unwrap();
    dm.set(root, "vector2", v2).unwrap();
    dm.set(root, "vector2 array", vec![v2, v2]).unwrap();
    dm.set(root, "vector3", v3).unwrap();
    dm.set(root, "vector3 array", vec![v3, v3]).unwrap();
    dm.set(root, "qangle", ang).unwrap();
    dm.set(root, "qangle array", vec![ang, ang]).unwrap();
    dm.set(root, "vector4", v4).unwrap();
    dm.set(root, "vector4 array", vec![v4, v4]).unwrap();
    dm.set(root, "quaternion", quat).unwrap();
    dm.set(root, "quaternion array", vec![quat, quat]).unwrap();
    dm.set(root, "matrix", mat).unwrap();
    dm.set(root, "matrix array", vec![mat, mat]).unwrap();

    (dm, root)
}

fn assert_populated(loaded: &Datamodel, original_root: Uuid) {
    assert_eq!(loaded.root(), Some(original_root), "root id must survive the trip");
    let root = loaded.element(original_root).unwrap();

    assert_eq!(*root.get::<i32>("int").unwrap(), 1);
    assert_eq!(root.get_array::<i32>("int array").unwrap(), &[1, 1]);
    assert!(approx(*root.get::<f32>("float").unwrap(), 1.5));
    assert!(approx_all(root.get_array::<f32>("float array").unwrap(), &[1.5, 1.5]));
    assert!(*root.get::<bool>("bool").unwrap());
    assert_eq!(root.get_array::<bool>("bool array").unwrap(), &[true, true]);

    let blob: Vec<u8> = (0u8..16).collect();
    assert_eq!(root.get::<Binary>("binary").unwrap().0, blob);
    let blobs = root.get_array::<Binary>("binary array").unwrap();
    assert_eq!(blobs.len(), 2);
    assert!(blobs.iter().all(|b| b.0 == blob));

    let time = *root.get::<Duration>("time").unwrap();
    assert!((time.as_secs_f64() - 300.0).abs() < 1e-4);
    assert_eq!(root.get_array::<Duration>("time array").unwrap().len(), 2);

    assert_eq!(*root.get::<Color>("color").unwrap(), Color::new(0, 0, 255, 255));
    assert_eq!(root.get_array::<Color>("color array").unwrap().len(), 2);

    let v2 = root.get::<Vector2>("vector2").unwrap();
    assert!(approx_all(&v2.components(), &[1.0, 2.0]));
    let v3 = root.get::<Vector3>("vector3").unwrap();
    assert!(approx_all(&v3.components(), &[1.0, 2.0, 3.0]));
    let ang = root.get::<Angle>("qangle").unwrap();
    assert!(approx_all(&ang.components(), &[1.0, 2.0, 3.0]));
    let v4 = root.get::<Vector4>("vector4").unwrap();
    assert!(approx_all(&v4.components(), &[1.0, 2.0, 3.0, 4.0]));

    let expected_quat = Quaternion::new(1.0, 2.0, 3.0, 4.0).normalised();
    let quat = root.get::<Quaternion>("quaternion").unwrap();
    assert!(approx_all(&quat.components(), &expected_quat.components()));
    for quat in root.get_array::<Quaternion>("quaternion array").unwrap() {
        assert!(approx_all(&quat.components(), &expected_quat.components()));
    }

    let expected_mat: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let mat = root.get::<Matrix4>("matrix").unwrap();
    assert!(approx_all(&mat.components(), &expected_mat));
    for mat in root.get_array::<Matrix4>("matrix array").unwrap() {
        assert!(approx_all(&mat.components(), &expected_mat));
    }

    // Insertion order survives the trip.
    let names: Vec<&str> = root.attributes().map(|(name, _)| name).collect();
    assert_eq!(names[0], "int");
    assert_eq!(names[1], "int array");
    assert_eq!(*names.last().unwrap(), "matrix array");
}

#[test]
fn populate_round_trip_binary_v5() {
    let (mut dm, root) = populate();
    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();

    let loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap();
    assert_populated(&loaded, root);
}

#[test]
fn populate_round_trip_keyvalues2_v1() {
    let (mut dm, root) = populate();
    let mut buffer = Vec::new();
    dm.save(&mut buffer, "keyvalues2", 1).unwrap();

    let loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap();
    assert_populated(&loaded, root);
}

#[test]
fn cross_encoding_resave_is_accepted() {
    let (mut dm, root) = populate();

    let mut binary = Vec::new();
    dm.save(&mut binary, "binary", 5).unwrap();
    let mut loaded = Datamodel::load(&mut Cursor::new(binary), DeferredMode::Disabled).unwrap();

    let mut text = Vec::new();
    loaded.save(&mut text, "keyvalues2", 1).unwrap();
    let reloaded = Datamodel::load(&mut Cursor::new(text), DeferredMode::Disabled).unwrap();
    assert_populated(&reloaded, root);
}

#[test]
fn stub_resolution_is_driven_by_the_resolver() {
    // A root referencing a GUID that nothing in the stream defines.
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();
    let missing = Uuid::new_v4();
    dm.create_stub(missing).unwrap();
    dm.set(root, "skeleton", Value::Element(Some(missing))).unwrap();

    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();

    // Without a resolver the reference stays a stub.
    let mut plain = Datamodel::load(&mut Cursor::new(buffer.clone()), DeferredMode::Disabled).unwrap();
    plain.get(root, "skeleton").unwrap();
    assert!(plain.element(missing).unwrap().is_stub());

    // With a resolver the next read yields the manufactured element.
    let mut resolved = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap();
    resolved.set_stub_resolver(Box::new(|_| {
        let mut element = Element::new("DmeSkeleton", "resolved");
        element.set("bones", 42);
        Some(element)
    }));
    let value = resolved.get(root, "skeleton").unwrap();
    let reference = match value {
        Value::Element(Some(id)) => id,
        other => panic!("expected an element reference, got {other:?}"),
    };
    assert_eq!(reference, missing);
    let element = resolved.element(reference).unwrap();
    assert!(!element.is_stub());
    assert_eq!(element.class(), "DmeSkeleton");
    assert_eq!(*element.get::<i32>("bones").unwrap(), 42);
}

#[test]
fn deferred_attribute_decodes_once() {
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();
    let samples: Vec<f32> = (0..4096).map(|i| i as f32 * 0.25).collect();
    dm.set(root, "samples", samples.clone()).unwrap();

    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();

    let mut loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Automatic).unwrap();
    let attribute = loaded.element(root).unwrap().attribute("samples").unwrap();
    assert!(attribute.is_deferred());
    assert!(attribute.offset() > 0);

    match loaded.get(root, "samples").unwrap() {
        Value::FloatArray(decoded) => assert_eq!(decoded, samples),
        other => panic!("expected a float array, got {other:?}"),
    }
    assert_eq!(loaded.element(root).unwrap().attribute("samples").unwrap().offset(), 0);

    // The codec can go away; the second access never reaches it.
    loaded.release_codec();
    match loaded.get(root, "samples").unwrap() {
        Value::FloatArray(decoded) => assert_eq!(decoded.len(), 4096),
        other => panic!("expected a float array, got {other:?}"),
    }
}

#[test]
fn disabled_mode_materializes_everything() {
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();
    dm.set(root, "samples", (0..4096).map(|i| i as f32).collect::<Vec<f32>>()).unwrap();

    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();

    let loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap();
    assert!(!loaded.has_deferred());
}

#[test]
fn materialize_all_prepares_for_read_only_traversal() {
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();
    dm.set(root, "samples", (0..1024).map(|i| i as f32).collect::<Vec<f32>>()).unwrap();
    dm.set(root, "weights", (0..1024).map(|i| i as i32).collect::<Vec<i32>>()).unwrap();

    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();

    let mut loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Always).unwrap();
    assert!(loaded.has_deferred());
    loaded.materialize_all().unwrap();
    assert!(!loaded.has_deferred());
    assert_eq!(loaded.element(root).unwrap().get_array::<f32>("samples").unwrap().len(), 1024);
}

#[test]
fn cross_datamodel_assignment_fails_without_mutating() {
    let mut a = Datamodel::new("model", 1);
    let mut b = Datamodel::new("model", 1);
    let owned_by_a = a.create_element("DmeChild", "child");
    let b_root = b.create_element("DmeModel", "root");

    let error = b.set(b_root, "stolen", Value::Element(Some(owned_by_a))).unwrap_err();
    assert!(matches!(error, DmError::ElementOwnership { element } if element == owned_by_a));
    assert_eq!(b.element(b_root).unwrap().attribute_count(), 0);

    let error = b
        .set(b_root, "stolen many", ElementArray::from_refs([Some(owned_by_a)]))
        .unwrap_err();
    assert!(matches!(error, DmError::ElementOwnership { .. }));
    assert_eq!(b.element(b_root).unwrap().attribute_count(), 0);
}

#[test]
fn time_attribute_fails_binary_v4_save() {
    let mut dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmeModel", "root");
    dm.set_root(root).unwrap();
    dm.set(root, "duration", Duration::from_secs(300)).unwrap();

    let mut buffer = Vec::new();
    assert!(matches!(dm.save(&mut buffer, "binary", 4), Err(DmError::AttributeType { .. })));

    // keyvalues2 and binary 5 both accept it.
    let mut buffer = Vec::new();
    dm.save(&mut buffer, "keyvalues2", 1).unwrap();
    let mut buffer = Vec::new();
    dm.save(&mut buffer, "binary", 5).unwrap();
}

#[test]
fn unknown_header_pair_fails_without_consuming_the_body() {
    let bytes = b"<!-- dmx encoding binary 9 format model 1 -->\nBODYBYTES".to_vec();
    let mut reader = Cursor::new(bytes);

    let error = Datamodel::load(&mut reader, DeferredMode::Disabled).unwrap_err();
    assert!(matches!(error, DmError::CodecNotFound { version: 9, .. }));

    // Only the header line was consumed.
    let mut rest = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut rest).unwrap();
    assert_eq!(rest, b"BODYBYTES");
}

#[test]
fn garbage_header_is_an_unsupported_format() {
    let bytes = b"this is not a dmx file\nmore bytes".to_vec();
    let error = Datamodel::load(&mut Cursor::new(bytes), DeferredMode::Disabled).unwrap_err();
    assert!(matches!(error, DmError::UnsupportedFormat(_)));
}

#[test]
fn matrix_from_fifteen_floats_is_a_domain_error() {
    assert!(matches!(
        Matrix4::from_floats((0..15).map(|i| i as f32)),
        Err(DmError::ValueDomain(_))
    ));
}
