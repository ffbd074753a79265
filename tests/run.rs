//! Compila, enlaza y ejecuta programas completos.
//!
//! Estas pruebas requieren un `cc` capaz de ensamblar x86-64. Si no se
//! encuentra, se omiten.

use ccx::{
    config::{Backend, Config},
    link::{LinkOptions, Linker},
    source::Source,
};

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Output},
    sync::atomic::{AtomicUsize, Ordering},
};

static NEXT_BINARY: AtomicUsize = AtomicUsize::new(0);

fn has_toolchain() -> bool {
    let found = cfg!(target_arch = "x86_64") && Command::new("cc").arg("--version").output().is_ok();
    if !found {
        eprintln!("note: no x86-64 `cc` found, skipping");
    }

    found
}

fn build_and_run(text: &str, backend: Backend) -> Output {
    let config = Config {
        backend,
        ..Config::default()
    };

    let asm = ccx::compile(Source::new("test.c", text), &config).unwrap();

    let id = NEXT_BINARY.fetch_add(1, Ordering::SeqCst);
    let binary: PathBuf = std::env::temp_dir().join(format!("ccx-run-{}-{}", std::process::id(), id));

    let mut linker = Linker::spawn(&binary, LinkOptions::empty()).unwrap();
    linker.stdin().write_all(&asm).unwrap();
    linker.finish().unwrap();

    let output = Command::new(&binary).output().unwrap();
    std::fs::remove_file(&binary).unwrap();

    output
}

fn check(text: &str, expected: i32) {
    if !has_toolchain() {
        return;
    }

    for backend in [Backend::Stack, Backend::Ir] {
        let output = build_and_run(text, backend);
        assert_eq!(output.status.code(), Some(expected), "{:?} backend:\n{}", backend, text);
    }
}

#[test]
fn arithmetic() {
    check("int main() { return 5 * (9 - 6); }", 15);
    check("int main() { return -7 / 2 + 10; }", 7);
    check("int main() { return 17 % 5 + (1 << 4) + (64 >> 2); }", 34);
    check("int main() { return (6 & 3) | (8 ^ 1); }", 11);
    check("int main() { return 3 < 4 && 4 <= 4 && 5 > 4 && !(1 == 2) && 1 != 2; }", 1);
}

#[test]
fn struct_members() {
    check(
        "struct pair { int x; int y; };
         int main() { struct pair p; p.x = 1; p.y = 2; return p.x + p.y; }",
        3,
    );

    check(
        "struct node { char tag; long value; struct node *next; };
         int main() {
             struct node a; struct node b; struct node *p;
             a.value = 40; a.next = &b; b.value = 2; p = &a;
             return p->value + p->next->value;
         }",
        42,
    );
}

#[test]
fn arrays_and_pointers() {
    check("int main() { int arr[3]; *(arr + 1) = 4; return *(arr + 1); }", 4);
    check("int main() { int x; int y; int *p; y = 1; p = &y; *p = 2; return y; }", 2);
    check(
        "int main() { int a[5]; int i; for (i = 0; i < 5; i++) a[i] = i * i; return a[4] - a[1] + (&a[4] - &a[1]); }",
        18,
    );
}

#[test]
fn recursion() {
    check(
        "int fib(int n) { if (n < 2) return 1; return fib(n - 1) + fib(n - 2); }
         int main() { return fib(7); }",
        21,
    );
}

#[test]
fn macros() {
    check("#define SQ(x) ((x)*(x))\nint main() { return SQ(3+1); }", 16);
    check(
        "#define LIMIT 10\n#ifndef LIMIT\n#define LIMIT 99\n#endif\nint main() { return LIMIT; }",
        10,
    );
}

#[test]
fn control_flow() {
    check(
        "int main() {
             int sum; int i;
             sum = 0; i = 0;
             while (1) { i++; if (i > 10) break; if (i % 2) continue; sum += i; }
             do sum--; while (sum > 25);
             return sum;
         }",
        25,
    );

    check(
        "int classify(int x) {
             switch (x) { case 1: return 10; case 2: case 3: return 20; default: return 30; }
         }
         int main() { return classify(1) + classify(3) + classify(9); }",
        60,
    );

    check("int main() { int x; x = 0; return x ? 1 : x == 0 ? 2 : 3; }", 2);
}

#[test]
fn globals_and_strings() {
    check(
        "int counter = 5;
         int table[3] = {1, 2, 3};
         char *name = \"hola\";
         char buffer[] = \"ab\";
         int main() { counter += table[2]; return counter + name[1] - 'o' + sizeof(buffer); }",
        11,
    );
}

#[test]
fn narrow_types() {
    check("int main() { char c; c = 200; return c < 0; }", 1);
    check("int main() { long big; big = 4294967296; return big / 4294967296 + sizeof(big); }", 9);
}

#[test]
fn increments_wrap_at_type_width() {
    check("int main() { char c; c = 127; return c++ == 127 && c == -128; }", 1);
    check("int main() { char c; c = -128; return c-- == -128 && c == 127; }", 1);
    check("int main() { char c; c = 127; return ++c == -128; }", 1);
    check("int main() { char c; c = -128; return --c == 127; }", 1);
    check("int main() { int i; i = 2147483647; return i++ == 2147483647 && i < 0; }", 1);
    check("int main() { long a[3]; long *p; a[0] = 7; a[1] = 9; p = a; return *p++ + *p; }", 16);
}

#[test]
fn assignment_value_is_stored_value() {
    check("int main() { char c; return (c = 300) == 44; }", 1);
    check("int main() { long x; char c; x = c = 300; return x; }", 44);
    check("int main() { int i; long x; x = i = 4294967297; return x; }", 1);
}

#[test]
fn many_arguments() {
    check(
        "int sum(int a, int b, int c, int d, int e, int f) { return a + b + c + d + e + f; }
         int main() { return sum(1, 2, 3, 4, 5, 6); }",
        21,
    );
}

#[test]
fn calls_into_libc() {
    if !has_toolchain() {
        return;
    }

    let text = "int printf(char *format, ...);
                int main() { printf(\"%d-%s\\n\", 42, \"ok\"); return 0; }";

    for backend in [Backend::Stack, Backend::Ir] {
        let output = build_and_run(text, backend);

        assert_eq!(output.status.code(), Some(0));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "42-ok\n");
    }
}
