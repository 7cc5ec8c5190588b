//! Native function registry (§4.8/§6): natives are plain globals backed
//! by a `NativeKind` tag that `Vm::call_native` matches on, each
//! returning `Result<Value, String>` per the calling convention the
//! distilled spec fixes. Grounded on `clox/vm.c`'s single `clockNative`
//! registration, generalized to the fuller set SPEC_FULL adds.

use crate::heap::Heap;
use crate::object::{NativeKind, ObjData, ObjNative};
use crate::value::Value;
use crate::vm::Vm;

fn define(vm: &mut Vm, name: &str, arity: u8, kind: NativeKind) {
    let name_handle = vm.heap_mut().intern_str(name);
    let native = vm.heap_mut().alloc(ObjData::Native(ObjNative {
        name: name_handle,
        arity,
        kind,
    }));
    vm.define_global(name, Value::Obj(native));
}

pub fn register_all(vm: &mut Vm) {
    define(vm, "clock", 0, NativeKind::Clock);
    define(vm, "rand", 0, NativeKind::Rand);
    define(vm, "sqrt", 1, NativeKind::Sqrt);
    define(vm, "len", 1, NativeKind::Len);
    define(vm, "print", 1, NativeKind::Print);
    define(vm, "hasProp", 2, NativeKind::HasProp);
    define(vm, "getProp", 2, NativeKind::GetProp);
    define(vm, "setProp", 3, NativeKind::SetProp);
    define(vm, "delProp", 2, NativeKind::DelProp);
}

fn string_bytes<'h>(heap: &'h Heap, value: Value) -> Option<&'h [u8]> {
    let handle = value.as_obj()?;
    match heap.get(handle) {
        ObjData::String(s) => Some(&s.bytes),
        _ => None,
    }
}

/// Dispatches one call by kind. Called from `Vm::call_native`, which
/// already validated arity against `ObjNative::arity`.
pub fn call(vm: &mut Vm, kind: NativeKind, args: &[Value]) -> Result<Value, String> {
    match kind {
        NativeKind::Clock => Ok(Value::Number(vm.elapsed_seconds())),
        NativeKind::Rand => Ok(Value::Number(pseudo_random(vm))),
        NativeKind::Sqrt => {
            let n = args[0].as_number().ok_or("sqrt expects a number")?;
            if n < 0.0 {
                return Err("sqrt expects a non-negative number".to_string());
            }
            Ok(Value::Number(n.sqrt()))
        }
        NativeKind::Len => {
            let bytes = string_bytes(vm.heap(), args[0]).ok_or("len expects a string")?;
            Ok(Value::Number(bytes.len() as f64))
        }
        NativeKind::Print => {
            let text = vm.format_value(args[0]);
            vm.print_line(&text);
            Ok(Value::Nil)
        }
        NativeKind::HasProp => has_prop(vm, args),
        NativeKind::GetProp => get_prop(vm, args),
        NativeKind::SetProp => set_prop(vm, args),
        NativeKind::DelProp => del_prop(vm, args),
    }
}

/// A simple xorshift generator seeded from the allocator's running byte
/// count, since the natives have no seedable RNG state of their own to
/// thread through — good enough for a scripting-language `rand()`, not
/// for anything cryptographic.
fn pseudo_random(vm: &mut Vm) -> f64 {
    let mut x = (vm.heap().bytes_allocated() as u64) ^ 0x9E3779B97F4A7C15;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x % 1_000_000) as f64 / 1_000_000.0
}

fn instance_handle_and_name(vm: &mut Vm, instance: Value, name: Value) -> Result<(crate::handle::Handle, crate::handle::Handle), String> {
    let instance_handle = instance.as_obj().ok_or("expected an instance")?;
    if !matches!(vm.heap().get(instance_handle), ObjData::Instance(_)) {
        return Err("expected an instance".to_string());
    }
    let name_bytes = string_bytes(vm.heap(), name).ok_or("expected a string property name")?.to_vec();
    let name_handle = vm.heap_mut().intern(&name_bytes);
    Ok((instance_handle, name_handle))
}

fn has_prop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (instance_handle, name_handle) = instance_handle_and_name(vm, args[0], args[1])?;
    let present = match vm.heap().get(instance_handle) {
        ObjData::Instance(i) => i.fields.contains(name_handle),
        _ => unreachable!(),
    };
    Ok(Value::Bool(present))
}

fn get_prop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (instance_handle, name_handle) = instance_handle_and_name(vm, args[0], args[1])?;
    match vm.heap().get(instance_handle) {
        ObjData::Instance(i) => Ok(i.fields.get(name_handle).copied().unwrap_or(Value::Nil)),
        _ => unreachable!(),
    }
}

fn set_prop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (instance_handle, name_handle) = instance_handle_and_name(vm, args[0], args[1])?;
    let value = args[2];
    match vm.heap_mut().get_mut(instance_handle) {
        ObjData::Instance(i) => {
            i.fields.insert(name_handle, value);
        }
        _ => unreachable!(),
    }
    Ok(value)
}

fn del_prop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (instance_handle, name_handle) = instance_handle_and_name(vm, args[0], args[1])?;
    let existed = match vm.heap_mut().get_mut(instance_handle) {
        ObjData::Instance(i) => i.fields.delete(name_handle),
        _ => unreachable!(),
    };
    Ok(Value::Bool(existed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::config::Config;

    #[test]
    fn sqrt_computes_correctly() {
        let mut vm = Vm::new(Config::default());
        let result = call(&mut vm, NativeKind::Sqrt, &[Value::Number(9.0)]).unwrap();
        assert_matches!(result, Value::Number(n) if (n - 3.0).abs() < 1e-9);
    }

    #[test]
    fn sqrt_of_negative_number_is_an_error() {
        let mut vm = Vm::new(Config::default());
        assert_matches!(call(&mut vm, NativeKind::Sqrt, &[Value::Number(-4.0)]), Err(_));
    }

    #[test]
    fn len_counts_bytes_of_interned_string() {
        let mut vm = Vm::new(Config::default());
        let handle = vm.heap_mut().intern_str("hello");
        let result = call(&mut vm, NativeKind::Len, &[Value::Obj(handle)]).unwrap();
        assert_matches!(result, Value::Number(n) if n == 5.0);
    }
}
