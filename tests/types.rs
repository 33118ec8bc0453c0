use std::any::Any;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use dyntype::{
    Composite, Concurrent, Config, HostAllocator, LanguageObject, PluginInterface, RttiHeader,
    TypeError, TypeResult, TypeSizeMeta, TypeSystem, ANONYMOUS_PLUGIN_ID,
};

const HEADER: usize = mem::size_of::<RttiHeader<()>>();

/// Language object that tracks how many of it are alive through the counter
/// passed as construction params.
struct Tracked {
    live: Arc<AtomicUsize>,
}

impl LanguageObject<()> for Tracked {
    fn construct(_sys: &(), params: Option<&dyn Any>) -> TypeResult<Self> {
        let live = params
            .and_then(|params| params.downcast_ref::<Arc<AtomicUsize>>())
            .expect("construction params carry the live counter")
            .clone();
        live.fetch_add(1, SeqCst);
        Ok(Tracked { live })
    }

    fn copy_construct(&self) -> TypeResult<Self> {
        self.live.fetch_add(1, SeqCst);
        Ok(Tracked {
            live: self.live.clone(),
        })
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.fetch_sub(1, SeqCst);
    }
}

fn counter_params(live: &Arc<AtomicUsize>) -> Option<&dyn Any> {
    Some(live as &dyn Any)
}

/// Language object without copy support; `copy_construct` is left at its
/// `UndefinedMethod` default.
struct NoCopy(#[allow(dead_code)] [u8; 8]);

impl LanguageObject<()> for NoCopy {
    fn construct(_sys: &(), _params: Option<&dyn Any>) -> TypeResult<Self> {
        Ok(NoCopy([0; 8]))
    }
}

#[derive(Default)]
struct PluginCounters {
    constructed: AtomicUsize,
    destroyed: AtomicUsize,
    assigned: AtomicUsize,
}

struct CountingPlugin {
    counters: Arc<PluginCounters>,
    refuse_construct: bool,
    refuse_assign: bool,
}

impl CountingPlugin {
    fn new(counters: &Arc<PluginCounters>) -> Box<Self> {
        Box::new(CountingPlugin {
            counters: counters.clone(),
            refuse_construct: false,
            refuse_assign: false,
        })
    }
}

unsafe impl PluginInterface<()> for CountingPlugin {
    fn construct_plugin(&self, _plugin: NonNull<u8>, _sys: &()) -> bool {
        if self.refuse_construct {
            return false;
        }
        self.counters.constructed.fetch_add(1, SeqCst);
        true
    }

    fn assign_plugin(&self, _dst: NonNull<u8>, _src: NonNull<u8>, _sys: &()) -> bool {
        if self.refuse_assign {
            return false;
        }
        self.counters.assigned.fetch_add(1, SeqCst);
        true
    }

    fn destroy_plugin(&self, _plugin: NonNull<u8>, _sys: &()) {
        self.counters.destroyed.fetch_add(1, SeqCst);
    }
}

#[test]
fn registering_the_same_name_twice_conflicts() {
    let ts = TypeSystem::<()>::new();
    ts.register_struct_type::<Tracked>("A", None).unwrap();
    let err = ts.register_struct_type::<Tracked>("A", None).unwrap_err();
    assert_eq!(err, TypeError::NameConflict("A".to_string()));
    assert_eq!(ts.types().filter(|ty| ty.name() == "A").count(), 1);
}

#[test]
fn sibling_names_only_conflict_under_the_same_parent() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let a = ts.register_struct_type::<Tracked>("A", None)?;
    let b = ts.register_struct_type::<Tracked>("B", None)?;
    let child_of_a = ts.register_struct_type::<Tracked>("Child", Some(&a))?;
    let child_of_b = ts.register_struct_type::<Tracked>("Child", Some(&b))?;
    assert_ne!(child_of_a, child_of_b);
    assert_eq!(ts.find_type("Child", Some(&a)).unwrap(), child_of_a);
    assert_eq!(ts.find_type("Child", Some(&b)).unwrap(), child_of_b);
    // The parent filter matches direct children only.
    assert!(ts.find_type("Child", None).is_none());
    Ok(())
}

#[test]
fn paths_resolve_against_the_parent_chain() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let a = ts.register_struct_type::<Tracked>("A", None)?;
    let b = ts.register_struct_type::<Tracked>("B", Some(&a))?;

    assert_eq!(ts.resolve_path("A", None).unwrap(), a);
    assert_eq!(ts.resolve_path("A::B", None).unwrap(), b);
    assert!(ts.resolve_path("A::C", None).is_none());
    assert!(ts.resolve_path("B", None).is_none());

    // Resolution can start from an explicit scope, and an empty path is
    // that scope.
    assert_eq!(ts.resolve_path("B", Some(&a)).unwrap(), b);
    assert_eq!(ts.resolve_path("", Some(&a)).unwrap(), a);
    assert_eq!(ts.resolve_path("A::", None).unwrap(), a);
    Ok(())
}

#[test]
fn abstract_types_refuse_construction() {
    let ts = TypeSystem::<()>::new();
    let x = ts.register_abstract_type::<[u8; 16]>("X", None).unwrap();
    assert!(x.is_abstract());
    assert!(matches!(
        ts.construct(&(), &x, None),
        Err(TypeError::AbstractConstruction)
    ));
    // The failed construction left no reference behind.
    assert_eq!(x.ref_count(), 0);
}

#[test]
fn zero_sized_types_are_rejected() {
    struct Empty;
    impl LanguageObject<()> for Empty {
        fn construct(_sys: &(), _params: Option<&dyn Any>) -> TypeResult<Self> {
            Ok(Empty)
        }
    }

    let ts = TypeSystem::<()>::new();
    let ty = ts.register_struct_type::<Empty>("Empty", None).unwrap();
    assert_eq!(ts.composite_size_for(&(), &ty, None), 0);
    assert!(matches!(ts.construct(&(), &ty, None), Ok(None)));
    assert_eq!(ty.ref_count(), 0);
}

#[test]
fn composite_layout_follows_the_chain() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let p = ts.register_struct_type::<Tracked>("P", None)?;
    let c = ts.register_struct_type::<Tracked>("C", Some(&p))?;
    let p_plugin = ts.register_struct_plugin::<[u64; 2]>(&p, 1);
    let c_plugin = ts.register_struct_plugin::<u64>(&c, 2);

    let lang = mem::size_of::<Tracked>();
    let expected = HEADER + lang + 16 + 8;
    assert_eq!(
        ts.composite_size_for(&(), &c, counter_params(&live)),
        expected
    );

    let obj = ts.construct(&(), &c, counter_params(&live))?.unwrap();
    assert_eq!(unsafe { ts.composite_size_of(&(), obj) }, expected);
    assert_eq!(unsafe { ts.type_of(obj) }, c);

    // Parent-declared plugins come before child-declared ones, right after
    // the language object.
    let p_addr = unsafe { ts.resolve_plugin(&(), obj, &p, p_plugin) }.unwrap();
    let c_addr = unsafe { ts.resolve_plugin(&(), obj, &c, c_plugin) }.unwrap();
    assert!(p_addr < c_addr);
    assert_eq!(p_addr.as_ptr() as usize - obj.as_ptr() as usize, HEADER + lang);
    assert_eq!(
        c_addr.as_ptr() as usize - obj.as_ptr() as usize,
        HEADER + lang + 16
    );

    unsafe { ts.destroy(&(), obj) };
    assert_eq!(live.load(SeqCst), 0);
    Ok(())
}

#[test]
fn refcounts_propagate_along_the_chain() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let p = ts.register_struct_type::<Tracked>("P", None)?;
    let c = ts.register_struct_type::<Tracked>("C", Some(&p))?;

    let obj = ts.construct(&(), &c, counter_params(&live))?.unwrap();
    assert_eq!(c.ref_count(), 1);
    assert_eq!(p.ref_count(), 1);
    assert!(p.is_immutable());

    let copy = unsafe { ts.clone_object(&(), obj) }?.unwrap();
    assert_eq!(c.ref_count(), 2);
    assert_eq!(p.ref_count(), 2);
    assert_eq!(live.load(SeqCst), 2);

    unsafe { ts.destroy(&(), copy) };
    assert_eq!(c.ref_count(), 1);
    assert_eq!(p.ref_count(), 1);

    unsafe { ts.destroy(&(), obj) };
    assert_eq!(c.ref_count(), 0);
    assert_eq!(p.ref_count(), 0);
    assert_eq!(live.load(SeqCst), 0);
    Ok(())
}

#[test]
fn explicit_references_pin_the_chain() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let p = ts.register_struct_type::<Tracked>("P", None)?;
    let c = ts.register_struct_type::<Tracked>("C", Some(&p))?;

    ts.reference_type(&c);
    assert!(c.is_immutable());
    assert!(p.is_immutable());

    ts.dereference_type(&c);
    assert!(!c.is_immutable());
    assert!(!p.is_immutable());

    // Mutable again: plugin registration goes through.
    ts.register_struct_plugin::<u64>(&p, 1);
    Ok(())
}

#[test]
fn clones_copy_plugin_state() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let ty = ts.register_struct_type::<Tracked>("Entity", None)?;
    let tag = ts.register_struct_plugin::<u64>(&ty, ANONYMOUS_PLUGIN_ID);

    let obj = ts.construct(&(), &ty, counter_params(&live))?.unwrap();
    unsafe {
        let slot = ts.resolve_plugin(&(), obj, &ty, tag).unwrap();
        slot.as_ptr().cast::<u64>().write(42);
    }

    let copy = unsafe { ts.clone_object(&(), obj) }?.unwrap();
    let value = unsafe {
        let slot = ts.resolve_plugin(&(), copy, &ty, tag).unwrap();
        slot.as_ptr().cast::<u64>().read()
    };
    assert_eq!(value, 42);

    unsafe {
        ts.destroy(&(), copy);
        ts.destroy(&(), obj);
    }
    assert_eq!(live.load(SeqCst), 0);
    Ok(())
}

#[test]
fn placement_construction_round_trips() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let ty = ts.register_struct_type::<Tracked>("Entity", None)?;
    ts.register_struct_plugin::<u64>(&ty, 1);

    let size = ts.composite_size_for(&(), &ty, counter_params(&live));
    assert_ne!(size, 0);
    let mut buffer = vec![0u64; (size + 7) / 8];
    let mem = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

    let obj = unsafe { ts.construct_placement(&(), mem, &ty, counter_params(&live)) }?.unwrap();
    assert_eq!(obj.as_ptr(), mem.as_ptr());
    assert_eq!(live.load(SeqCst), 1);
    assert_eq!(ty.ref_count(), 1);

    // The language object is reachable both ways.
    let roundtrip: Composite<()> = unsafe { Composite::from_object_ptr(obj.object_ptr()) };
    assert_eq!(roundtrip.as_ptr(), obj.as_ptr());

    unsafe { ts.destroy_placement(&(), obj) };
    assert_eq!(live.load(SeqCst), 0);
    assert_eq!(ty.ref_count(), 0);
    Ok(())
}

#[test]
fn plugin_refusal_unwinds_construction() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let counters = Arc::new(PluginCounters::default());
    let p = ts.register_struct_type::<Tracked>("P", None)?;
    let c = ts.register_struct_type::<Tracked>("C", Some(&p))?;

    ts.register_plugin(&p, 8, 1, CountingPlugin::new(&counters));
    let mut refusing = CountingPlugin::new(&counters);
    refusing.refuse_construct = true;
    ts.register_plugin(&c, 8, 2, refusing);

    assert!(matches!(
        ts.construct(&(), &c, counter_params(&live)),
        Ok(None)
    ));

    // The parent's block was built and then torn down again; the language
    // object and the references went with it.
    assert_eq!(counters.constructed.load(SeqCst), 1);
    assert_eq!(counters.destroyed.load(SeqCst), 1);
    assert_eq!(live.load(SeqCst), 0);
    assert_eq!(p.ref_count(), 0);
    assert_eq!(c.ref_count(), 0);
    Ok(())
}

#[test]
fn assign_refusal_unwinds_the_clone() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let counters = Arc::new(PluginCounters::default());
    let ty = ts.register_struct_type::<Tracked>("Entity", None)?;

    let mut refusing = CountingPlugin::new(&counters);
    refusing.refuse_assign = true;
    ts.register_plugin(&ty, 8, 1, refusing);

    let obj = ts.construct(&(), &ty, counter_params(&live))?.unwrap();
    assert_eq!(counters.constructed.load(SeqCst), 1);

    assert!(matches!(unsafe { ts.clone_object(&(), obj) }, Ok(None)));
    assert_eq!(counters.constructed.load(SeqCst), 2);
    assert_eq!(counters.destroyed.load(SeqCst), 1);
    assert_eq!(counters.assigned.load(SeqCst), 0);
    assert_eq!(live.load(SeqCst), 1);
    assert_eq!(ty.ref_count(), 1);

    unsafe { ts.destroy(&(), obj) };
    assert_eq!(live.load(SeqCst), 0);
    Ok(())
}

#[test]
fn cloning_requires_copy_support() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let counters = Arc::new(PluginCounters::default());
    let ty = ts.register_struct_type::<NoCopy>("Opaque", None)?;
    ts.register_plugin(&ty, 8, 1, CountingPlugin::new(&counters));

    let obj = ts.construct(&(), &ty, None)?.unwrap();
    assert!(matches!(
        unsafe { ts.clone_object(&(), obj) },
        Err(TypeError::UndefinedMethod)
    ));

    // Nothing of the failed clone remains.
    assert_eq!(counters.constructed.load(SeqCst), 1);
    assert_eq!(counters.destroyed.load(SeqCst), 0);
    assert_eq!(ty.ref_count(), 1);

    unsafe { ts.destroy(&(), obj) };
    assert_eq!(counters.destroyed.load(SeqCst), 1);
    assert_eq!(ty.ref_count(), 0);
    Ok(())
}

#[test]
fn register_then_delete_restores_the_registry() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    ts.register_struct_type::<Tracked>("A", None)?;
    ts.register_struct_type::<Tracked>("B", None)?;

    let before: Vec<String> = ts.types().map(|ty| ty.name().to_string()).collect();
    let tmp = ts.register_struct_type::<Tracked>("Temp", None)?;
    ts.delete_type(&tmp);
    let after: Vec<String> = ts.types().map(|ty| ty.name().to_string()).collect();
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn deleting_a_type_reparents_its_children() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let a = ts.register_struct_type::<Tracked>("A", None)?;
    let b = ts.register_struct_type::<Tracked>("B", Some(&a))?;
    assert_eq!(a.child_count(), 1);
    assert!(ts.resolve_path("B", None).is_none());

    ts.delete_type(&a);
    assert!(ts.parent_of(&b).is_none());
    assert_eq!(ts.resolve_path("B", None).unwrap(), b);
    Ok(())
}

#[test]
fn reparenting_moves_a_subtree() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let p1 = ts.register_struct_type::<Tracked>("P1", None)?;
    let p2 = ts.register_struct_type::<Tracked>("P2", None)?;
    let x = ts.register_struct_type::<Tracked>("X", Some(&p1))?;

    // Same parent: a no-op.
    ts.set_parent(&x, Some(&p1))?;
    assert_eq!(p1.child_count(), 1);

    ts.set_parent(&x, Some(&p2))?;
    assert_eq!(ts.parent_of(&x).unwrap(), p2);
    assert_eq!(p1.child_count(), 0);
    assert_eq!(p2.child_count(), 1);
    assert!(ts.inherits_from(&p2, &x));
    assert!(!ts.inherits_from(&p1, &x));
    Ok(())
}

#[test]
fn reparenting_checks_name_uniqueness() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let p1 = ts.register_struct_type::<Tracked>("P1", None)?;
    let p2 = ts.register_struct_type::<Tracked>("P2", None)?;
    let x1 = ts.register_struct_type::<Tracked>("X", Some(&p1))?;
    ts.register_struct_type::<Tracked>("X", Some(&p2))?;

    assert_eq!(
        ts.set_parent(&x1, Some(&p2)),
        Err(TypeError::NameConflict("X".to_string()))
    );
    // The failed re-root changed nothing.
    assert_eq!(ts.parent_of(&x1).unwrap(), p1);
    Ok(())
}

#[test]
fn inheritance_is_reflexive_and_transitive() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let a = ts.register_struct_type::<Tracked>("A", None)?;
    let b = ts.register_struct_type::<Tracked>("B", Some(&a))?;
    let c = ts.register_struct_type::<Tracked>("C", Some(&b))?;

    assert!(ts.inherits_from(&a, &c));
    assert!(ts.inherits_from(&b, &c));
    assert!(ts.inherits_from(&c, &c));
    assert!(!ts.inherits_from(&c, &a));

    assert!(c.is_end_type());
    assert!(!a.is_end_type());
    assert_eq!(a.child_count(), 1);
    assert_eq!(b.child_count(), 1);
    Ok(())
}

#[test]
fn exclusivity_is_a_host_visible_flag() {
    let ts = TypeSystem::<()>::new();
    let ty = ts.register_abstract_type::<u64>("X", None).unwrap();
    assert!(!ty.is_exclusive());
    ty.set_exclusive(true);
    assert!(ty.is_exclusive());
    ty.set_exclusive(false);
    assert!(!ty.is_exclusive());
}

#[test]
fn unregistered_plugins_stop_resolving() -> TypeResult<()> {
    let ts = TypeSystem::<()>::new();
    let live = Arc::new(AtomicUsize::new(0));
    let ty = ts.register_struct_type::<Tracked>("Entity", None)?;
    let first = ts.register_struct_plugin::<u64>(&ty, 1);
    let second = ts.register_struct_plugin::<u64>(&ty, 2);
    ts.unregister_plugin(&ty, first);

    let obj = ts.construct(&(), &ty, counter_params(&live))?.unwrap();
    unsafe {
        assert!(ts.resolve_plugin(&(), obj, &ty, first).is_none());
        assert!(ts.resolve_plugin(&(), obj, &ty, second).is_some());
        ts.destroy(&(), obj);
    }
    Ok(())
}

#[test]
#[should_panic(expected = "while it is referenced")]
fn plugin_registration_locks_once_referenced() {
    // Leaked so the panic does not reach the system's drop-time shutdown
    // while an instance is still live.
    let ts: &'static TypeSystem<()> = Box::leak(Box::new(TypeSystem::new()));
    let live = Arc::new(AtomicUsize::new(0));
    let p = ts.register_struct_type::<Tracked>("P", None).unwrap();
    let c = ts.register_struct_type::<Tracked>("C", Some(&p)).unwrap();

    let _obj = ts
        .construct(&(), &c, counter_params(&live))
        .unwrap()
        .unwrap();

    // P is transitively referenced by the live instance of C.
    ts.register_struct_plugin::<u64>(&p, 1);
}

#[test]
#[should_panic(expected = "inheritance cycle")]
fn reparenting_rejects_cycles() {
    let ts = TypeSystem::<()>::new();
    let a = ts.register_struct_type::<Tracked>("A", None).unwrap();
    let b = ts.register_struct_type::<Tracked>("B", Some(&a)).unwrap();
    let _ = ts.set_parent(&a, Some(&b));
}

#[test]
fn dynamic_types_size_by_meta() -> TypeResult<()> {
    #[repr(C)]
    struct Blob {
        #[allow(dead_code)]
        words: u64,
    }

    impl LanguageObject<()> for Blob {
        fn construct(_sys: &(), params: Option<&dyn Any>) -> TypeResult<Self> {
            let words = *params.and_then(|p| p.downcast_ref::<usize>()).unwrap_or(&0);
            Ok(Blob {
                words: words as u64,
            })
        }
    }

    // Sizes the object as the struct head plus `words` trailing words; the
    // instance size is recovered from the head.
    struct BlobMeta;
    impl TypeSizeMeta<()> for BlobMeta {
        fn size_from_params(&self, _sys: &(), params: Option<&dyn Any>) -> usize {
            let words = *params.and_then(|p| p.downcast_ref::<usize>()).unwrap_or(&0);
            mem::size_of::<Blob>() + words * 8
        }

        fn size_from_instance(&self, _sys: &(), obj: NonNull<u8>) -> usize {
            let words = unsafe { obj.as_ptr().cast::<u64>().read() } as usize;
            mem::size_of::<Blob>() + words * 8
        }
    }

    let ts = TypeSystem::<()>::new();
    let ty = ts.register_dynamic_struct_type::<Blob>("Blob", Arc::new(BlobMeta), None)?;
    let tail = ts.register_dependant_struct_plugin::<u64>(&ty, 9, 16);

    let words: usize = 3;
    let lang = mem::size_of::<Blob>() + words * 8;
    let expected = HEADER + lang + 16;
    assert_eq!(
        ts.composite_size_for(&(), &ty, Some(&words as &dyn Any)),
        expected
    );

    let obj = ts.construct(&(), &ty, Some(&words as &dyn Any))?.unwrap();
    assert_eq!(unsafe { ts.composite_size_of(&(), obj) }, expected);

    // The plugin block sits after the dynamically sized language object.
    let slot = unsafe { ts.resolve_plugin(&(), obj, &ty, tail) }.unwrap();
    assert_eq!(slot.as_ptr() as usize - obj.as_ptr() as usize, HEADER + lang);

    unsafe { ts.destroy(&(), obj) };
    Ok(())
}

#[test]
fn allocation_failure_yields_no_instance() {
    struct NoMemory;

    unsafe impl HostAllocator for NoMemory {
        fn allocate(&self, _layout: std::alloc::Layout) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: std::alloc::Layout) {
            unreachable!("nothing was ever allocated")
        }
    }

    let ts = TypeSystem::<()>::with_config(Config::new().allocator(Arc::new(NoMemory)));
    let live = Arc::new(AtomicUsize::new(0));
    let ty = ts.register_struct_type::<Tracked>("Starved", None).unwrap();

    assert!(matches!(
        ts.construct(&(), &ty, counter_params(&live)),
        Ok(None)
    ));
    assert_eq!(ty.ref_count(), 0);
    assert_eq!(live.load(SeqCst), 0);
}

#[test]
fn concurrent_systems_share_across_threads() {
    let config = Config::new().lock_provider(Concurrent);
    let ts = TypeSystem::<(), Concurrent>::with_config(config);
    let live = Arc::new(AtomicUsize::new(0));
    let ty = ts.register_struct_type::<Tracked>("Shared", None).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    let obj = ts
                        .construct(&(), &ty, counter_params(&live))
                        .unwrap()
                        .unwrap();
                    unsafe { ts.destroy(&(), obj) };
                }
            });
        }
    });

    assert_eq!(live.load(SeqCst), 0);
    assert_eq!(ty.ref_count(), 0);
}
