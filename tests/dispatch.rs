use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use briny_dispatch::attribute::{Attribute, AttributeMap};
use briny_dispatch::backend::{Backend, BackendClass, DataLayout, DataType, Place};
use briny_dispatch::context::{ExecutionContext, KernelContext};
use briny_dispatch::device::{DeviceContext, DeviceContextPool};
use briny_dispatch::error::{DeviceError, KernelError};
use briny_dispatch::fallback::{AcceleratorPolicy, Tier};
use briny_dispatch::kernel_key::LibraryOverride;
use briny_dispatch::ops;
use briny_dispatch::prepared::PreparedKernel;
use briny_dispatch::registry::{ArgDef, KernelEntry, LegacyKernelType, OperatorInfo};
use briny_dispatch::signature::KernelSignature;
use briny_dispatch::tensor::{DenseTensor, Tensor};
use briny_dispatch::variable::{EagerVariable, NameVarMap, Variable, VariableLike};
use briny_dispatch::{
    DispatchError, Dispatcher, KernelKey, OperatorInvocation, Registry, RegistryBuilder, RuntimeFlags,
};
use num_complex::Complex;

#[derive(Debug)]
struct FakeDevice {
    place: Place,
    broken: bool,
}

impl DeviceContext for FakeDevice {
    fn place(&self) -> Place {
        self.place
    }

    fn wait(&self) -> Result<(), DeviceError> {
        if self.broken {
            return Err(DeviceError::Async {
                place: self.place,
                message: "illegal address".to_string(),
            });
        }
        Ok(())
    }
}

fn accelerator_pool(broken: bool) -> DeviceContextPool {
    let make = move |place: Place| -> Result<Arc<dyn DeviceContext>, DeviceError> {
        Ok(Arc::new(FakeDevice { place, broken }))
    };
    DeviceContextPool::new()
        .with_factory(BackendClass::Gpu, make)
        .with_factory(BackendClass::Xpu, make)
}

fn dispatcher(registry: Registry) -> Dispatcher {
    Dispatcher::new(registry)
        .with_flags(RuntimeFlags::default())
        .with_pool(accelerator_pool(false))
}

fn reference_dispatcher(flags: RuntimeFlags) -> Dispatcher {
    let mut builder = RegistryBuilder::new();
    ops::register_reference_ops(&mut builder).unwrap();
    Dispatcher::new(builder.build()).with_flags(flags)
}

fn inputs(pairs: Vec<(&str, DenseTensor)>) -> NameVarMap<Variable> {
    pairs
        .into_iter()
        .map(|(name, t)| (name.to_string(), vec![Variable::new(name.to_lowercase()).with_tensor(t)]))
        .collect()
}

fn outputs(names: &[&str]) -> NameVarMap<Variable> {
    names
        .iter()
        .map(|name| (name.to_string(), vec![Variable::new(name.to_lowercase())]))
        .collect()
}

fn f32s(shape: &[usize], data: &[f32]) -> DenseTensor {
    Tensor::new(shape.to_vec(), data.to_vec()).into()
}

fn marker(value: f32, place: Place) -> DenseTensor {
    f32s(&[1], &[value]).with_place(place)
}

fn out_f32(outs: &NameVarMap<Variable>, name: &str) -> Vec<f32> {
    outs[name][0].tensor().unwrap().data::<f32>().unwrap().to_vec()
}

/// Operator `relu` with a unified CPU kernel writing `2.0` and a legacy CPU
/// kernel writing `1.0`.
fn relu_op(builder: &mut RegistryBuilder, unified_key: KernelKey, legacy: LegacyKernelType) {
    builder
        .operator(OperatorInfo::new("relu").with_legacy_kernel(legacy, |ctx: &mut ExecutionContext<'_>| {
            let place = ctx.place();
            *ctx.output("Out")? = marker(1.0, place);
            Ok(())
        }))
        .unwrap();
    builder
        .default_signature("relu", KernelSignature::new("relu", &["X"], &[], &["Out"]))
        .unwrap();
    builder
        .kernel(
            "relu",
            unified_key,
            KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                let place = ctx.device_context().place();
                *ctx.required_output(0)? = marker(2.0, place);
                Ok(())
            }),
        )
        .unwrap();
}

#[test]
fn test_unified_kernel_wins_over_legacy() {
    let mut builder = RegistryBuilder::new();
    relu_op(
        &mut builder,
        KernelKey::cpu(DataType::Float32),
        LegacyKernelType::cpu(DataType::Float32),
    );
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[2], &[-1.0, 1.0]))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("relu", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::Unified);
    assert!(prepared.kernel().is_unified());
    assert_eq!(prepared.signature().map(|s| s.name.as_str()), Some("relu"));

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(out_f32(&outs, "Out"), vec![2.0]);
}

#[test]
fn test_unified_cpu_kernel_is_tried_before_legacy() {
    let mut builder = RegistryBuilder::new();
    relu_op(
        &mut builder,
        KernelKey::cpu(DataType::Float32),
        LegacyKernelType::new(Place::Gpu(0), DataLayout::Any, DataType::Float32, Default::default()),
    );
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[1], &[3.0]).with_place(Place::Gpu(0)))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("relu", &ins, &outs, &attrs, &defaults, Place::Gpu(0));
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::UnifiedCpu);
    assert_eq!(prepared.kernel_key(), KernelKey::cpu(DataType::Float32));
    assert_eq!(prepared.device_context().place(), Place::Cpu);

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    let out = outs["Out"][0].tensor().unwrap();
    assert_eq!(out.place(), Place::Cpu);
}

#[test]
fn test_legacy_kernel_on_the_target_device() {
    let mut builder = RegistryBuilder::new();
    builder
        .operator(OperatorInfo::new("sigmoid").with_legacy_kernel(
            LegacyKernelType::new(Place::Gpu(0), DataLayout::Any, DataType::Float32, Default::default()),
            |ctx: &mut ExecutionContext<'_>| {
                let place = ctx.place();
                *ctx.output("Out")? = marker(0.5, place);
                Ok(())
            },
        ))
        .unwrap();
    let d = dispatcher(builder.build());

    // Legacy kernels registered for device 0 serve every ordinal.
    let ins = inputs(vec![("X", f32s(&[1], &[0.0]))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("sigmoid", &ins, &outs, &attrs, &defaults, Place::Gpu(1));
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::Legacy);
    assert_eq!(prepared.device_context().place(), Place::Gpu(1));
    assert!(prepared.signature().is_none());

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(outs["Out"][0].tensor().unwrap().place(), Place::Gpu(1));
}

fn conv_registry(with_cpu_kernel: bool, unsupported: bool, calls: Arc<AtomicUsize>) -> Registry {
    let xpu = LegacyKernelType::new(Place::Xpu(0), DataLayout::Any, DataType::Float32, Default::default());
    let mut info = OperatorInfo::new("conv").with_legacy_kernel(xpu, |ctx: &mut ExecutionContext<'_>| {
        let place = ctx.place();
        *ctx.output("Output")? = marker(-1.0, place);
        Ok(())
    });
    if with_cpu_kernel {
        info = info.with_legacy_kernel(
            LegacyKernelType::cpu(DataType::Float32),
            move |ctx: &mut ExecutionContext<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
                let place = ctx.place();
                if place != Place::Cpu {
                    return Err(KernelError(format!("host kernel launched on {place}")));
                }
                let x = ctx.required_input("Input")?.clone();
                *ctx.output("Output")? = x;
                Ok(())
            },
        );
    }

    let mut builder = RegistryBuilder::new();
    builder.operator(info).unwrap();
    if unsupported {
        builder.accelerator(
            AcceleratorPolicy::new(BackendClass::Xpu).with_unsupported(|op, dtype| {
                op == "conv" && dtype == DataType::Float32
            }),
        );
    }
    builder.build()
}

#[test]
fn test_unsupported_accelerator_op_degrades_to_host() {
    let calls = Arc::new(AtomicUsize::new(0));
    let d = dispatcher(conv_registry(true, true, Arc::clone(&calls)));

    let ins = inputs(vec![("Input", f32s(&[2], &[1.0, 2.0]).with_place(Place::Xpu(0)))]);
    let mut outs = outputs(&["Output"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("conv", &ins, &outs, &attrs, &defaults, Place::Xpu(0));
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::LegacyCpu);
    assert_eq!(prepared.kernel_key().backend, Backend::Cpu);
    assert_eq!(prepared.device_context().place(), Place::Cpu);

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(out_f32(&outs, "Output"), vec![1.0, 2.0]);
}

#[test]
fn test_unsupported_accelerator_op_without_host_kernel_fails() {
    let d = dispatcher(conv_registry(false, true, Arc::new(AtomicUsize::new(0))));

    let ins = inputs(vec![("Input", f32s(&[1], &[1.0]))]);
    let outs = outputs(&["Output"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("conv", &ins, &outs, &attrs, &defaults, Place::Xpu(0));
    match d.prepare(&inv) {
        Err(DispatchError::ResolutionFailure { op_type, attempted }) => {
            assert_eq!(op_type, "conv");
            assert!(attempted.to_string().contains("unsupported on accelerator"));
        }
        other => panic!("expected a resolution failure, got {other:?}"),
    }
}

#[test]
fn test_scenario_conv_missing_on_accelerator_runs_on_host() {
    // Only a host kernel and no unsupported-op predicate: the accelerator
    // lookup misses and the host kernel is used.
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = RegistryBuilder::new();
    let counter = Arc::clone(&calls);
    builder
        .operator(OperatorInfo::new("conv").with_legacy_kernel(
            LegacyKernelType::cpu(DataType::Float32),
            move |ctx: &mut ExecutionContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let place = ctx.place();
                *ctx.output("Output")? = marker(7.0, place);
                Ok(())
            },
        ))
        .unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("Input", f32s(&[1], &[1.0]).with_place(Place::Xpu(0)))]);
    let mut outs = outputs(&["Output"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("conv", &ins, &outs, &attrs, &defaults, Place::Xpu(0));
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::LegacyCpu);
    assert_eq!(prepared.device_context().place(), Place::Cpu);

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let out = outs["Output"][0].tensor().unwrap();
    assert_eq!(out.place(), Place::Cpu);
    assert_eq!(out.data::<f32>(), Some(&[7.0][..]));
}

#[test]
fn test_gpu_miss_does_not_degrade_without_policy() {
    let mut builder = RegistryBuilder::new();
    builder
        .operator(OperatorInfo::new("conv").with_legacy_kernel(
            LegacyKernelType::cpu(DataType::Float32),
            |_: &mut ExecutionContext<'_>| Ok(()),
        ))
        .unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("Input", f32s(&[1], &[1.0]))]);
    let outs = outputs(&["Output"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("conv", &ins, &outs, &attrs, &defaults, Place::Gpu(0));
    assert!(matches!(
        d.prepare(&inv),
        Err(DispatchError::ResolutionFailure { .. })
    ));
}

#[test]
fn test_resolution_is_deterministic() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let ins = inputs(vec![
        ("X", f32s(&[2], &[1.0, 2.0])),
        ("Y", f32s(&[2], &[3.0, 4.0])),
    ]);
    let outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("add", &ins, &outs, &attrs, &defaults, Place::Cpu);

    let a = d.prepare(&inv).unwrap();
    let b = d.prepare(&inv).unwrap();
    assert_eq!(a.kernel_key(), b.kernel_key());
    assert_eq!(a.tier(), b.tier());
    assert_eq!(a.signature(), b.signature());
    match (a.kernel(), b.kernel()) {
        (PreparedKernel::Function { func: fa, .. }, PreparedKernel::Function { func: fb, .. }) => {
            assert!(Arc::ptr_eq(fa, fb));
        }
        other => panic!("expected two function kernels, got {other:?}"),
    }
}

#[test]
fn test_scenario_broadcast_add() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let ins = inputs(vec![
        ("X", f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
        ("Y", f32s(&[3], &[10.0, 20.0, 30.0])),
    ]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());

    let inv = OperatorInvocation::new("add", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.kernel_key(), KernelKey::cpu(DataType::Float32));
    assert_eq!(prepared.tier(), Tier::Unified);
    assert_eq!(
        prepared.signature(),
        Some(&KernelSignature::new("add", &["X", "Y"], &["axis"], &["Out"]))
    );

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    let out = outs["Out"][0].tensor().unwrap();
    assert_eq!(out.shape(), &[2, 3]);
    assert_eq!(
        out.data::<f32>(),
        Some(&[11.0, 22.0, 33.0, 14.0, 25.0, 36.0][..])
    );
    // inputs are left alone
    assert_eq!(ins["Y"][0].tensor().unwrap().shape(), &[3]);
}

#[test]
fn test_scenario_operator_without_kernels() {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("mystery")).unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[1], &[1.0]))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let err = d
        .execute("mystery", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap_err();
    assert_eq!(err.op_type(), Some("mystery"));
    assert!(matches!(err, DispatchError::ResolutionFailure { .. }));
    assert!(outs["Out"][0].tensor().is_none());

    let err = d
        .execute("nonexistent", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownOperator(ref op) if op == "nonexistent"));
}

#[test]
fn test_complex_gradient_restored_to_real_forward_dtype() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let c = |re: f32| Complex::new(re, 1.0);
    let x: DenseTensor = Tensor::new(vec![2], vec![c(1.0), c(2.0)]).into();
    let y: DenseTensor = Tensor::new(vec![2], vec![c(0.5), c(0.5)]).into();
    let ins = inputs(vec![("X", x), ("Y", y)]);
    let mut outs: NameVarMap<Variable> = NameVarMap::new();
    outs.insert(
        "Out".to_string(),
        vec![Variable::new("x@GRAD").with_forward_dtype(DataType::Float32)],
    );
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());

    d.execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
    let out = outs["Out"][0].tensor().unwrap();
    assert_eq!(out.dtype(), DataType::Float32);
    assert_eq!(out.data::<f32>(), Some(&[1.5, 2.5][..]));
}

#[test]
fn test_complex_gradient_left_alone_without_real_forward() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let x: DenseTensor = Tensor::new(vec![1], vec![Complex::new(1.0f64, -1.0)]).into();
    let y: DenseTensor = Tensor::new(vec![1], vec![Complex::new(1.0f64, 1.0)]).into();
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());

    let ins = inputs(vec![("X", x.clone()), ("Y", y.clone())]);
    let mut outs = outputs(&["Out"]);
    d.execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
    assert_eq!(outs["Out"][0].tensor().unwrap().dtype(), DataType::Complex128);

    let mut outs: NameVarMap<Variable> = NameVarMap::new();
    outs.insert(
        "Out".to_string(),
        vec![Variable::new("z@GRAD").with_forward_dtype(DataType::Complex128)],
    );
    d.execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
    assert_eq!(outs["Out"][0].tensor().unwrap().dtype(), DataType::Complex128);

    let eager_ins: NameVarMap<EagerVariable> = [
        ("X".to_string(), vec![EagerVariable::new("x").with_tensor(x)]),
        ("Y".to_string(), vec![EagerVariable::new("y").with_tensor(y)]),
    ]
    .into_iter()
    .collect();
    let mut eager_outs: NameVarMap<EagerVariable> =
        [("Out".to_string(), vec![EagerVariable::new("out")])].into_iter().collect();
    d.execute("add", &eager_ins, &mut eager_outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
    let out = eager_outs["Out"][0].tensor().unwrap();
    assert_eq!(out.data::<Complex<f64>>(), Some(&[Complex::new(2.0, 0.0)][..]));
}

#[test]
fn test_check_numerics_reports_the_variable() {
    let flags = RuntimeFlags::default().with_check_numerics(true);
    let d = reference_dispatcher(flags);
    let ins = inputs(vec![
        ("X", f32s(&[3], &[1.0, f32::NAN, f32::INFINITY])),
        ("Y", f32s(&[3], &[1.0, 1.0, 1.0])),
    ]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    match d.execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu) {
        Err(DispatchError::NumericFailure { op_type, var, nan, inf, .. }) => {
            assert_eq!(op_type, "add");
            assert_eq!(var, "out");
            assert_eq!((nan, inf), (1, 1));
        }
        other => panic!("expected a numeric failure, got {other:?}"),
    }

    let d = reference_dispatcher(RuntimeFlags::default());
    d.execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
}

fn xpu_copy_registry() -> Registry {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("copy")).unwrap();
    builder
        .default_signature("copy", KernelSignature::new("copy", &["X"], &[], &["Out"]))
        .unwrap();
    builder
        .kernel(
            "copy",
            KernelKey::new(Backend::Xpu, DataLayout::Any, DataType::Float32),
            KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                let x = ctx.required_input(0)?.clone();
                *ctx.required_output(0)? = x;
                Ok(())
            }),
        )
        .unwrap();
    builder.build()
}

#[test]
fn test_benchmark_surfaces_device_errors() {
    let ins = inputs(vec![("X", f32s(&[1], &[1.0]).with_place(Place::Xpu(0)))]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());

    let quiet = Dispatcher::new(xpu_copy_registry())
        .with_flags(RuntimeFlags::default())
        .with_pool(accelerator_pool(true));
    let mut outs = outputs(&["Out"]);
    quiet
        .execute("copy", &ins, &mut outs, &attrs, &defaults, Place::Xpu(0))
        .unwrap();

    let synced = Dispatcher::new(xpu_copy_registry())
        .with_flags(RuntimeFlags::default().with_benchmark(true))
        .with_pool(accelerator_pool(true));
    let mut outs = outputs(&["Out"]);
    match synced.execute("copy", &ins, &mut outs, &attrs, &defaults, Place::Xpu(0)) {
        Err(DispatchError::DeviceFailure { op_type, source }) => {
            assert_eq!(op_type, "copy");
            assert!(matches!(source, DeviceError::Async { place: Place::Xpu(0), .. }));
        }
        other => panic!("expected a device failure, got {other:?}"),
    }
}

fn conv2d_registry(with_onednn_kernel: bool) -> Registry {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("conv2d")).unwrap();
    builder
        .default_signature("conv2d", KernelSignature::new("conv2d", &["Input"], &[], &["Output"]))
        .unwrap();
    builder
        .kernel(
            "conv2d",
            KernelKey::cpu(DataType::Float32),
            KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                *ctx.required_output(0)? = marker(1.0, Place::Cpu);
                Ok(())
            }),
        )
        .unwrap();
    if with_onednn_kernel {
        builder
            .kernel(
                "conv2d",
                KernelKey::new(Backend::OneDnn, DataLayout::OneDnn, DataType::Float32),
                KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                    *ctx.required_output(0)? = marker(2.0, Place::Cpu);
                    Ok(())
                }),
            )
            .unwrap();
    }
    builder.library_override(LibraryOverride::one_dnn(|dtype| dtype == DataType::Float32));
    builder.build()
}

#[test]
fn test_library_override_upgrades_and_reverts() {
    let flags = RuntimeFlags::default().with_accelerated_layout(true);
    let ins = inputs(vec![("Input", f32s(&[1], &[1.0]))]);
    let attrs: AttributeMap = [("use_mkldnn".to_string(), Attribute::Bool(true))]
        .into_iter()
        .collect();
    let defaults = AttributeMap::new();

    let d = Dispatcher::new(conv2d_registry(true)).with_flags(flags);
    let mut outs = outputs(&["Output"]);
    let inv = OperatorInvocation::new("conv2d", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(
        prepared.kernel_key(),
        KernelKey::new(Backend::OneDnn, DataLayout::OneDnn, DataType::Float32)
    );
    assert_eq!(prepared.device_context().place(), Place::Cpu);
    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(out_f32(&outs, "Output"), vec![2.0]);

    // no library kernel: the base key is used instead
    let d = Dispatcher::new(conv2d_registry(false)).with_flags(flags);
    let inv = OperatorInvocation::new("conv2d", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.kernel_key(), KernelKey::cpu(DataType::Float32));
    assert_eq!(prepared.tier(), Tier::Unified);

    // the request attribute gates the upgrade
    let d = Dispatcher::new(conv2d_registry(true)).with_flags(flags);
    let no_request = AttributeMap::new();
    let inv = OperatorInvocation::new("conv2d", &ins, &outs, &no_request, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.kernel_key(), KernelKey::cpu(DataType::Float32));
}

#[test]
fn test_argument_mapping_picks_signature_from_inputs() {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("fc")).unwrap();
    builder.argument_mapping("fc", |ctx| {
        if ctx.has_input("Bias") {
            KernelSignature::new("fc_bias", &["Input", "W", "Bias"], &[], &["Out"])
        } else {
            KernelSignature::new("matmul", &["Input", "W"], &[], &["Out"])
        }
    });
    for name in ["fc_bias", "matmul"] {
        builder
            .kernel(
                name,
                KernelKey::cpu(DataType::Float32),
                KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                    let n = ctx.num_inputs() as f32;
                    *ctx.required_output(0)? = marker(n, Place::Cpu);
                    Ok(())
                }),
            )
            .unwrap();
    }
    let d = dispatcher(builder.build());
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());

    let ins = inputs(vec![("Input", f32s(&[1], &[1.0])), ("W", f32s(&[1], &[1.0]))]);
    let mut outs = outputs(&["Out"]);
    let inv = OperatorInvocation::new("fc", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.signature().map(|s| s.name.as_str()), Some("matmul"));
    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(out_f32(&outs, "Out"), vec![2.0]);

    let ins = inputs(vec![
        ("Input", f32s(&[1], &[1.0])),
        ("W", f32s(&[1], &[1.0])),
        ("Bias", f32s(&[1], &[1.0])),
    ]);
    let inv = OperatorInvocation::new("fc", &ins, &outs, &attrs, &defaults, Place::Cpu);
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.signature().map(|s| s.name.as_str()), Some("fc_bias"));
}

#[test]
fn test_inputs_transformed_without_touching_the_caller() {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("sum")).unwrap();
    builder
        .default_signature("sum", KernelSignature::new("sum", &["X"], &[], &["Out"]))
        .unwrap();
    let f64_def = ArgDef::from_key(KernelKey::cpu(DataType::Float64));
    builder
        .kernel(
            "sum",
            KernelKey::cpu(DataType::Float32),
            KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                let x = ctx.required_input(0)?;
                let data = x
                    .data::<f64>()
                    .ok_or_else(|| KernelError(format!("got {}", x.dtype())))?;
                let total: f64 = data.iter().sum();
                *ctx.required_output(0)? = Tensor::new(vec![1], vec![total]).into();
                Ok(())
            })
            .with_inputs(vec![f64_def]),
        )
        .unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[3], &[1.0, 2.0, 3.5]))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    d.execute("sum", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap();
    let out = outs["Out"][0].tensor().unwrap();
    assert_eq!(out.data::<f64>(), Some(&[6.5][..]));
    assert_eq!(ins["X"][0].tensor().unwrap().dtype(), DataType::Float32);
}

#[test]
fn test_shape_inference_failure_stops_execution() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let ins = inputs(vec![
        ("X", f32s(&[2], &[1.0, 2.0])),
        ("Y", f32s(&[3], &[1.0, 2.0, 3.0])),
    ]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let err = d
        .execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShapeInferenceFailure { .. }));
    assert!(!outs["Out"][0].tensor().is_some_and(DenseTensor::is_initialized));
}

#[test]
fn test_mixed_input_dtypes_rejected_by_default_policy() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let ins = inputs(vec![
        ("X", f32s(&[1], &[1.0])),
        ("Y", Tensor::new(vec![1], vec![1.0f64]).into()),
    ]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let err = d
        .execute("add", &ins, &mut outs, &attrs, &defaults, Place::Cpu)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidInvocation { .. }));
}

#[test]
fn test_kernel_failure_names_the_kernel() {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("boom")).unwrap();
    builder
        .kernel(
            "boom",
            KernelKey::cpu(DataType::Float32),
            KernelEntry::structured(|_: &mut ExecutionContext<'_>| Err(KernelError("exploded".to_string()))),
        )
        .unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[1], &[1.0]))]);
    let mut outs = outputs(&["Out"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    match d.execute("boom", &ins, &mut outs, &attrs, &defaults, Place::Cpu) {
        Err(DispatchError::KernelFailure { op_type, kernel, source }) => {
            assert_eq!(op_type, "boom");
            assert!(kernel.contains("boom"));
            assert_eq!(source, KernelError("exploded".to_string()));
        }
        other => panic!("expected a kernel failure, got {other:?}"),
    }
}

#[test]
fn test_unsupported_accelerator_vetoes_unified_kernel() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut builder = RegistryBuilder::new();
    builder
        .operator(OperatorInfo::new("conv").with_legacy_kernel(
            LegacyKernelType::cpu(DataType::Float32),
            move |ctx: &mut ExecutionContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let place = ctx.place();
                *ctx.output("Output")? = marker(3.0, place);
                Ok(())
            },
        ))
        .unwrap();
    builder
        .default_signature("conv", KernelSignature::new("conv", &["Input"], &[], &["Output"]))
        .unwrap();
    builder
        .kernel(
            "conv",
            KernelKey::new(Backend::Xpu, DataLayout::Any, DataType::Float32),
            KernelEntry::function(|_: &mut KernelContext<'_>| {
                Err(KernelError("accelerator kernel must not run".to_string()))
            }),
        )
        .unwrap();
    builder.accelerator(AcceleratorPolicy::new(BackendClass::Xpu).with_unsupported(|op, _| op == "conv"));
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("Input", f32s(&[1], &[1.0]).with_place(Place::Xpu(0)))]);
    let mut outs = outputs(&["Output"]);
    let (attrs, defaults) = (AttributeMap::new(), AttributeMap::new());
    let inv = OperatorInvocation::new("conv", &ins, &outs, &attrs, &defaults, Place::Xpu(0));
    let prepared = d.prepare(&inv).unwrap();
    assert_eq!(prepared.tier(), Tier::LegacyCpu);
    assert!(!prepared.kernel().is_unified());
    assert_eq!(prepared.device_context().place(), Place::Cpu);

    prepared.run(&ins, &mut outs, &attrs, &defaults).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(out_f32(&outs, "Output"), vec![3.0]);
}

#[test]
fn test_dispatcher_shared_across_threads() {
    let d = reference_dispatcher(RuntimeFlags::default());
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let d = &d;
                s.spawn(move || {
                    let v = i as f32;
                    let ins = inputs(vec![
                        ("X", f32s(&[2], &[v, v + 1.0])),
                        ("Y", f32s(&[1], &[10.0])),
                    ]);
                    let mut outs = outputs(&["Out"]);
                    let none = AttributeMap::new();
                    d.execute("add", &ins, &mut outs, &none, &none, Place::Cpu)
                        .unwrap();
                    (v, out_f32(&outs, "Out"))
                })
            })
            .collect();
        for h in handles {
            let (v, out) = h.join().unwrap();
            assert_eq!(out, vec![v + 10.0, v + 11.0]);
        }
    });
}

#[test]
fn test_integer_add_overflow_wraps_instead_of_panicking() {
    let d = reference_dispatcher(RuntimeFlags::default());
    let ins = inputs(vec![
        ("X", Tensor::new(vec![2], vec![i32::MAX, 5]).into()),
        ("Y", Tensor::new(vec![1], vec![1i32]).into()),
    ]);
    let mut outs = outputs(&["Out"]);
    let none = AttributeMap::new();
    d.execute("add", &ins, &mut outs, &none, &none, Place::Cpu)
        .unwrap();
    let out = outs["Out"][0].tensor().unwrap();
    assert_eq!(out.data::<i32>(), Some(&[i32::MIN, 6][..]));
}

#[test]
fn test_unified_kernel_writes_list_outputs() {
    let mut builder = RegistryBuilder::new();
    builder.operator(OperatorInfo::new("split")).unwrap();
    builder
        .default_signature("split", KernelSignature::new("split", &["X"], &[], &["Out"]))
        .unwrap();
    builder
        .kernel(
            "split",
            KernelKey::cpu(DataType::Float32),
            KernelEntry::function(|ctx: &mut KernelContext<'_>| {
                let x = ctx.required_input(0)?;
                let data = x
                    .data::<f32>()
                    .ok_or_else(|| KernelError("X must be float32".to_string()))?;
                let parts = ctx.outputs_len(0);
                if parts == 0 || data.len() % parts != 0 {
                    return Err(KernelError(format!("cannot split {} into {parts}", data.len())));
                }
                let chunk = data.len() / parts;
                for (i, piece) in data.chunks(chunk).enumerate() {
                    let out = ctx
                        .output_at(0, i)
                        .ok_or_else(|| KernelError(format!("missing output #{i}")))?;
                    *out = f32s(&[chunk], piece);
                }
                Ok(())
            }),
        )
        .unwrap();
    let d = dispatcher(builder.build());

    let ins = inputs(vec![("X", f32s(&[4], &[1.0, 2.0, 3.0, 4.0]))]);
    let mut outs: NameVarMap<Variable> = NameVarMap::new();
    outs.insert("Out".to_string(), vec![Variable::new("head"), Variable::new("tail")]);
    let none = AttributeMap::new();
    d.execute("split", &ins, &mut outs, &none, &none, Place::Cpu)
        .unwrap();

    let head = outs["Out"][0].tensor().unwrap();
    let tail = outs["Out"][1].tensor().unwrap();
    assert_eq!(head.data::<f32>(), Some(&[1.0, 2.0][..]));
    assert_eq!(tail.data::<f32>(), Some(&[3.0, 4.0][..]));
}
