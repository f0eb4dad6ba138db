use cffi_core::{
    CKind, ConstValue, Declaration, ErrorKind, Field, FunctionSig, HostValue, Record, Session,
    SymbolTable, TypeNode,
};
use std::ffi::c_void;
use std::rc::Rc;

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn point_norm1(p: *const Point) -> i32 {
    let p = unsafe { &*p };
    p.x.abs() + p.y.abs()
}

#[repr(C)]
struct Small {
    a: i32,
}

#[repr(C)]
struct Triple {
    a: f64,
    b: f64,
    c: f64,
}

extern "C" fn small_value(s: Small) -> i32 {
    s.a
}

extern "C" fn triple_sum(t: Triple) -> i32 {
    (t.a + t.b + t.c) as i32
}

fn int() -> TypeNode {
    TypeNode::builtin(CKind::Int)
}

fn session() -> Session {
    let session = Session::new();
    session.add_resolver(
        SymbolTable::new()
            .with("add", add as *const c_void)
            .with("point_norm1", point_norm1 as *const c_void)
            .with("small_value", small_value as *const c_void)
            .with("triple_sum", triple_sum as *const c_void),
    );
    session
}

#[test]
fn test_add_two_and_three() {
    let s = session();
    s.declare(Declaration::function("add", FunctionSig::of(int(), [int(), int()])))
        .unwrap();

    let result = s.call("add", &[HostValue::Integer(2), HostValue::Integer(3)]).unwrap();
    assert_eq!(result, HostValue::Integer(5));
}

#[test]
fn test_add_with_one_argument() {
    let s = session();
    s.declare(Declaration::function("add", FunctionSig::of(int(), [int(), int()])))
        .unwrap();

    let err = s.call("add", &[HostValue::Integer(2)]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ArgumentCountMismatch { .. }));
}

#[test]
fn test_link_name() {
    let s = session();
    let decl = cffi_core::FunctionDecl::new("plus", FunctionSig::of(int(), [int(), int()]))
        .with_link_name("add");
    s.declare(Declaration::Function(decl)).unwrap();
    assert_eq!(
        s.call("plus", &[HostValue::Integer(40), HostValue::Integer(2)]).unwrap(),
        HostValue::Integer(42)
    );
}

#[test]
fn test_struct_pointer_argument() {
    let s = session();
    let point = Rc::new(Record::new("point", false));
    s.declare(Declaration::Record(point.clone())).unwrap();
    point
        .set_fields(vec![Field::new("x", int()), Field::new("y", int())])
        .unwrap();

    let ty = s.resolve_type("struct point").unwrap();
    s.declare(Declaration::function(
        "point_norm1",
        FunctionSig::of(int(), [TypeNode::pointer_to(ty.clone())]),
    ))
    .unwrap();

    let p = s
        .new_value(&ty, None, &[HostValue::Integer(-3), HostValue::Integer(4)])
        .unwrap();
    assert_eq!(
        s.call("point_norm1", &[HostValue::Cdata(p)]).unwrap(),
        HostValue::Integer(7)
    );
}

#[test]
fn test_batch_is_atomic() {
    let s = session();
    s.declare(Declaration::constant("TAKEN", int(), ConstValue::Int(1)))
        .unwrap();

    let result = s.declare_batch(|scope| {
        scope.add(Declaration::function("fresh", FunctionSig::of(int(), [])))?;
        scope.add(Declaration::constant("TAKEN", int(), ConstValue::Int(2)))?;
        Ok(())
    });

    let err = result.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DeclarationConflict { .. }));
    assert!(s.lookup("fresh").is_none());
    assert_eq!(s.constant("TAKEN").unwrap(), HostValue::Integer(1));
}

#[test]
fn test_failed_batch_leaves_forward_record_opaque() {
    let s = Session::new();
    let fwd = Rc::new(Record::new("node", false));
    s.declare(Declaration::Record(fwd.clone())).unwrap();
    s.declare(Declaration::constant("TAKEN", int(), ConstValue::Int(1)))
        .unwrap();

    let result = s.declare_batch(|scope| {
        scope.fill_record(&fwd, vec![Field::new("v", int())])?;
        scope.add(Declaration::constant("TAKEN", int(), ConstValue::Int(2)))?;
        Ok(())
    });
    assert!(result.is_err());
    assert!(fwd.is_opaque());
    assert!(s.sizeof(&TypeNode::of_record(&fwd), None).is_err());

    s.declare_batch(|scope| scope.fill_record(&fwd, vec![Field::new("v", int())]))
        .unwrap();
    assert!(!fwd.is_opaque());
    assert_eq!(s.sizeof(&TypeNode::of_record(&fwd), None).unwrap(), 4);
}

#[test]
fn test_batch_commits() {
    let s = session();
    s.declare_batch(|scope| {
        scope.add(Declaration::function("add", FunctionSig::of(int(), [int(), int()])))?;
        scope.add(Declaration::typedef("myint", int()))?;
        assert!(scope.lookup("myint").is_some());
        Ok(())
    })
    .unwrap();

    assert!(s.resolve_type("myint").unwrap().is_same(&int(), false, false));
    assert_eq!(
        s.call("add", &[HostValue::Integer(1), HostValue::Integer(1)]).unwrap(),
        HostValue::Integer(2)
    );
}

#[test]
fn test_record_redefinition_conflicts() {
    let s = Session::new();
    let first = Record::with_fields("pair", false, vec![Field::new("a", int())]).unwrap();
    s.declare(Declaration::Record(Rc::new(first))).unwrap();

    let second = Record::with_fields(
        "pair",
        false,
        vec![Field::new("a", int()), Field::new("b", int())],
    )
    .unwrap();
    let err = s.declare(Declaration::Record(Rc::new(second))).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DeclarationConflict { .. }));

    // forward declaration of an existing record is fine
    s.declare(Declaration::Record(Rc::new(Record::new("pair", false))))
        .unwrap();
}

#[test]
fn test_opaque_record_filled_once() {
    let record = Record::new("later", false);
    assert!(record.is_opaque());
    assert!(TypeNode::pointer_to(TypeNode::of_record(&Rc::new(Record::new("x", false))))
        .alloc_size()
        .is_ok());

    record.set_fields(vec![Field::new("v", int())]).unwrap();
    assert!(!record.is_opaque());
    let err = record.set_fields(vec![Field::new("w", int())]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DeclarationConflict { .. }));
}

#[test]
fn test_incomplete_record_cannot_be_sized() {
    let s = Session::new();
    let opaque = Rc::new(Record::new("handle", false));
    let ty = TypeNode::of_record(&opaque);
    let err = s.new_value(&ty, None, &[]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IncompleteType { .. }));
    assert!(s.new_value(&TypeNode::pointer_to(ty), None, &[]).is_ok());
}

#[test]
fn test_same_tag_records_get_their_own_descriptors() {
    let s = session();
    let double = TypeNode::builtin(CKind::Double);
    let small = Rc::new(Record::with_fields("s", false, vec![Field::new("a", int())]).unwrap());
    let triple = Rc::new(
        Record::with_fields(
            "s",
            false,
            vec![
                Field::new("a", double.clone()),
                Field::new("b", double.clone()),
                Field::new("c", double),
            ],
        )
        .unwrap(),
    );
    let small_ty = TypeNode::of_record(&small);
    let triple_ty = TypeNode::of_record(&triple);
    assert_eq!(small_ty.to_string(), triple_ty.to_string());

    s.declare(Declaration::function("small_value", FunctionSig::of(int(), [small_ty.clone()])))
        .unwrap();
    s.declare(Declaration::function("triple_sum", FunctionSig::of(int(), [triple_ty.clone()])))
        .unwrap();

    let one = s.new_value(&small_ty, None, &[HostValue::Integer(4)]).unwrap();
    assert_eq!(s.call("small_value", &[HostValue::Cdata(one)]).unwrap(), HostValue::Integer(4));

    let three = s
        .new_value(&triple_ty, None, &[1.0, 2.0, 3.0].map(HostValue::Number))
        .unwrap();
    assert_eq!(s.call("triple_sum", &[HostValue::Cdata(three)]).unwrap(), HostValue::Integer(6));
    assert_eq!(s.cached_descriptors(), 2);
}
