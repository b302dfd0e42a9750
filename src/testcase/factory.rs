use super::cluster::{CallableSignature, TestCluster};
use super::model::{Primitive, StatementKind, TestCase, VarId};
use crate::config::SearchConfig;
use crate::tracer::DynamicConstantPool;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use std::sync::Arc;

const PRINTABLE: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 _-.,:;!?";

/// What a new call statement invokes.
enum Callee<'a> {
    Function(&'a CallableSignature),
    Constructor(&'a str, &'a [String]),
    Method(VarId, &'a CallableSignature),
}

/// Random construction and modification of test cases over a [`TestCluster`].
pub struct TestFactory {
    cluster: Arc<TestCluster>,
    config: SearchConfig,
}

impl TestFactory {
    pub fn new(cluster: Arc<TestCluster>, config: SearchConfig) -> Self {
        Self { cluster, config }
    }

    pub fn cluster(&self) -> &TestCluster {
        &self.cluster
    }

    pub fn max_length(&self) -> usize {
        self.config.chromosome_length
    }

    /// A test case of random length, built by repeated insertion.
    pub fn random_test_case(&self, rng: &mut impl Rng, pool: &DynamicConstantPool) -> TestCase {
        let mut test_case = TestCase::new();
        let target = rng.gen_range(1..=self.config.chromosome_length.max(1));
        let mut attempts = 0;
        while test_case.len() < target && attempts < 2 * target {
            self.insert_random_statement(&mut test_case, rng, pool);
            attempts += 1;
        }
        test_case
    }

    /// Insert a random call (with any arguments it needs) at a random
    /// position. Returns `false` when nothing could be inserted.
    pub fn insert_random_statement(
        &self,
        test_case: &mut TestCase,
        rng: &mut impl Rng,
        pool: &DynamicConstantPool,
    ) -> bool {
        let position = rng.gen_range(0..=test_case.len());
        let Some(callee) = self.pick_callee(test_case, position, rng) else {
            return false;
        };
        let before = test_case.len();
        let params = match &callee {
            Callee::Function(sig) | Callee::Method(_, sig) => sig.params.as_slice(),
            Callee::Constructor(_, params) => *params,
        };
        let mut position = position;
        let mut args = Vec::with_capacity(params.len());
        for _ in params {
            let (var, inserted) = self.argument(test_case, position, rng, pool);
            if inserted {
                position += 1;
            }
            args.push(var);
        }
        let kind = match callee {
            Callee::Function(sig) => StatementKind::FunctionCall {
                function: sig.name.clone(),
                args,
            },
            Callee::Constructor(class, _) => StatementKind::ConstructorCall {
                class: class.to_string(),
                args,
            },
            Callee::Method(receiver, sig) => StatementKind::MethodCall {
                receiver,
                method: sig.name.clone(),
                args,
            },
        };
        test_case.insert(position, kind);
        test_case.len() > before
    }

    fn pick_callee<'a>(
        &'a self,
        test_case: &TestCase,
        position: usize,
        rng: &mut impl Rng,
    ) -> Option<Callee<'a>> {
        let mut options: Vec<Callee<'a>> = Vec::new();
        for function in &self.cluster.functions {
            options.push(Callee::Function(function));
        }
        for class in &self.cluster.classes {
            options.push(Callee::Constructor(&class.name, &class.constructor_params));
            let instances = test_case.instances_before(position, &class.name);
            if let Some(&receiver) = instances.choose(rng) {
                for method in &class.methods {
                    options.push(Callee::Method(receiver, method));
                }
            }
        }
        options.into_iter().choose(rng)
    }

    /// A variable to pass as an argument at `position`: an earlier one, or a
    /// fresh primitive inserted right there (`true` in the second slot).
    fn argument(
        &self,
        test_case: &mut TestCase,
        position: usize,
        rng: &mut impl Rng,
        pool: &DynamicConstantPool,
    ) -> (VarId, bool) {
        let existing = test_case.vars_before(position);
        if !existing.is_empty() && rng.gen_bool(self.config.primitive_reuse_probability) {
            if let Some(&var) = existing.choose(rng) {
                return (var, false);
            }
        }
        let primitive = self.random_primitive(rng, pool);
        (test_case.insert(position, StatementKind::Primitive(primitive)), true)
    }

    pub fn random_primitive(&self, rng: &mut impl Rng, pool: &DynamicConstantPool) -> Primitive {
        if !pool.is_empty() && rng.gen_bool(self.config.seeded_primitives_reuse_probability) {
            if let Some(seeded) = seeded_primitive(rng, pool) {
                return seeded;
            }
        }
        match rng.gen_range(0..10) {
            0 => Primitive::None,
            1 => Primitive::Bool(rng.gen_bool(0.5)),
            2..=4 => Primitive::Float(
                (rng.gen_range(-(self.config.max_int as f64)..=self.config.max_int as f64) * 100.0).round()
                    / 100.0,
            ),
            5..=6 => Primitive::Str(self.random_string(rng)),
            _ => Primitive::Int(rng.gen_range(-self.config.max_int..=self.config.max_int)),
        }
    }

    fn random_string(&self, rng: &mut impl Rng) -> String {
        let len = rng.gen_range(0..=self.config.string_length);
        (0..len).map(|_| random_char(rng)).collect()
    }

    /// Replace the value or one input of the statement at `position`.
    pub fn change_statement(
        &self,
        test_case: &mut TestCase,
        position: usize,
        rng: &mut impl Rng,
        pool: &DynamicConstantPool,
    ) -> bool {
        let Some(statement) = test_case.statements.get(position) else {
            return false;
        };
        match statement.kind.clone() {
            StatementKind::Primitive(value) => {
                let changed = self.mutate_primitive(&value, rng, pool);
                let changed_any = changed != value;
                test_case.statements[position].kind = StatementKind::Primitive(changed);
                changed_any
            }
            StatementKind::MethodCall { receiver, .. } if rng.gen_bool(0.2) => {
                let Some(class) = test_case.class_of(receiver).map(str::to_string) else {
                    return false;
                };
                let others: Vec<VarId> = test_case
                    .instances_before(position, &class)
                    .into_iter()
                    .filter(|&v| v != receiver)
                    .collect();
                match others.choose(rng) {
                    Some(&other) => {
                        if let StatementKind::MethodCall { receiver, .. } = &mut test_case.statements[position].kind {
                            *receiver = other;
                        }
                        true
                    }
                    None => false,
                }
            }
            kind => {
                let arg_count = match &kind {
                    StatementKind::FunctionCall { args, .. }
                    | StatementKind::ConstructorCall { args, .. }
                    | StatementKind::MethodCall { args, .. } => args.len(),
                    StatementKind::Primitive(_) => 0,
                };
                if arg_count == 0 {
                    return false;
                }
                let index = rng.gen_range(0..arg_count);
                let (var, inserted) = self.argument(test_case, position, rng, pool);
                let position = if inserted { position + 1 } else { position };
                match &mut test_case.statements[position].kind {
                    StatementKind::FunctionCall { args, .. }
                    | StatementKind::ConstructorCall { args, .. }
                    | StatementKind::MethodCall { args, .. } => {
                        let changed = args[index] != var;
                        args[index] = var;
                        changed
                    }
                    StatementKind::Primitive(_) => false,
                }
            }
        }
    }

    fn mutate_primitive(&self, value: &Primitive, rng: &mut impl Rng, pool: &DynamicConstantPool) -> Primitive {
        if rng.gen_bool(0.1) {
            return self.random_primitive(rng, pool);
        }
        match value {
            Primitive::None => self.random_primitive(rng, pool),
            Primitive::Bool(b) => Primitive::Bool(!b),
            Primitive::Int(i) => {
                let delta = rng.gen_range(-(self.config.max_int / 16).max(1)..=(self.config.max_int / 16).max(1));
                Primitive::Int(i.saturating_add(if delta == 0 { 1 } else { delta }))
            }
            Primitive::Float(f) => {
                let delta = rng.gen_range(-1.0..=1.0) * 10f64.powi(rng.gen_range(-2..=2));
                Primitive::Float(f + delta)
            }
            Primitive::Str(s) => Primitive::Str(mutate_string(s, rng, self.config.string_length)),
        }
    }
}

fn random_char(rng: &mut impl Rng) -> char {
    PRINTABLE[rng.gen_range(0..PRINTABLE.len())] as char
}

/// Delete, replace and insert characters, each with probability 1/len.
fn mutate_string(s: &str, rng: &mut impl Rng, max_len: usize) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    let p = 1.0 / (chars.len().max(1) as f64);
    chars.retain(|_| !rng.gen_bool(p));
    for c in chars.iter_mut() {
        if rng.gen_bool(p) {
            *c = random_char(rng);
        }
    }
    let mut k = 1;
    while rng.gen_bool(0.5f64.powi(k)) && chars.len() < max_len.max(1) {
        let at = rng.gen_range(0..=chars.len());
        chars.insert(at, random_char(rng));
        k += 1;
    }
    let out: String = chars.into_iter().collect();
    if out == s {
        let mut forced = out;
        forced.push(random_char(rng));
        forced
    } else {
        out
    }
}

fn seeded_primitive(rng: &mut impl Rng, pool: &DynamicConstantPool) -> Option<Primitive> {
    let mut kinds = Vec::new();
    if !pool.ints.is_empty() {
        kinds.push(0);
    }
    if !pool.floats.is_empty() {
        kinds.push(1);
    }
    if !pool.strings.is_empty() {
        kinds.push(2);
    }
    match *kinds.choose(rng)? {
        0 => pool.ints.iter().choose(rng).map(|i| Primitive::Int(*i)),
        1 => pool.floats.choose(rng).map(|f| Primitive::Float(*f)),
        _ => pool.strings.iter().choose(rng).map(|s| Primitive::Str(s.clone())),
    }
}
