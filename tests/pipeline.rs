use ccx::{
    config::{Backend, Config, DumpFlags},
    source::Source,
};

const BACKENDS: [Backend; 2] = [Backend::Stack, Backend::Ir];

fn config(backend: Backend) -> Config {
    Config {
        backend,
        ..Config::default()
    }
}

fn compile(text: &str, config: &Config) -> Result<String, String> {
    ccx::compile(Source::new("test.c", text), config)
        .map(|asm| String::from_utf8(asm).unwrap())
        .map_err(|diagnostics| diagnostics.to_string())
}

#[test]
fn assembly_layout() {
    let text = "int counter = 7;
                int table[4];
                char *greeting = \"hola\";
                static int helper(int x) { return x * 2; }
                int main() { return helper(counter); }";

    for backend in BACKENDS {
        let asm = compile(text, &config(backend)).unwrap();

        assert!(asm.starts_with("\t.intel_syntax noprefix\n"), "{}", asm);

        let data = asm.find("\t.data\n").unwrap();
        let bss = asm.find("\t.bss\n").unwrap();
        let text = asm.find("\t.text\n").unwrap();
        assert!(data < bss && bss < text, "{}", asm);

        assert!(asm[data..bss].contains("counter:"), "{}", asm);
        assert!(asm[data..bss].contains(".L.str.0:"), "{}", asm);
        assert!(asm[bss..text].contains("table:\n\t.zero 16\n"), "{}", asm);

        assert!(asm[text..].contains("\t.globl main\nmain:\n"), "{}", asm);
        assert!(asm[text..].contains("helper:\n"), "{}", asm);
        assert!(!asm.contains(".globl helper"), "{}", asm);
        assert!(asm.contains(".Lmain.return:"), "{}", asm);
    }
}

#[test]
fn prototypes_emit_no_code() {
    for backend in BACKENDS {
        let asm = compile("int puts(char *s); int main() { return 0; }", &config(backend)).unwrap();
        assert!(!asm.contains("puts:"), "{}", asm);
    }
}

#[test]
fn lexical_errors() {
    let error = compile("int main() { return 1 @ 2; }", &Config::default()).unwrap_err();

    assert!(error.starts_with("Lexical error: "), "{}", error);
    assert!(error.contains(" --> test.c:1:23"), "{}", error);
    assert!(error.ends_with("Build failed with 1 error\n"), "{}", error);
}

#[test]
fn syntax_errors() {
    let error = compile("int main() { return 1 }", &Config::default()).unwrap_err();
    assert!(error.starts_with("Syntax error: "), "{}", error);
}

#[test]
fn oversized_objects_are_rejected() {
    for text in ["long a[1000000000]; int main() { return 0; }", "int main() { long a[1000000000]; return 0; }"] {
        for backend in BACKENDS {
            let error = compile(text, &config(backend)).unwrap_err();
            assert!(error.starts_with("Syntax error: Object is too large"), "{}", error);
        }
    }

    let text = "int main() { long a[200000000]; long b[200000000]; return 0; }";
    let error = compile(text, &Config::default()).unwrap_err();
    assert!(error.starts_with("Semantic error: Stack frame of `main`"), "{}", error);
}

#[test]
fn redefined_functions_are_rejected() {
    let text = "int f() { return 1; }\nint f() { return 2; }\nint main() { return f(); }";
    let error = compile(text, &Config::default()).unwrap_err();

    assert!(error.starts_with("Syntax error: Redefinition of function `f`"), "{}", error);
    assert!(error.contains(" --> test.c:2:5"), "{}", error);
}

#[test]
fn preprocessor_errors() {
    let error = compile("#ifdef X\nint main() { return 0; }\n", &Config::default()).unwrap_err();
    assert!(error.starts_with("Preprocessor error: "), "{}", error);
}

#[test]
fn semantic_errors() {
    let text = "struct s { int x; }; int main() { struct s a; return a + 1; }";
    let error = compile(text, &Config::default()).unwrap_err();

    assert!(error.starts_with("Semantic error: "), "{}", error);
}

#[test]
fn implicit_declarations() {
    let text = "int main() { return undeclared(1); }";

    let error = compile(text, &Config::default()).unwrap_err();
    assert!(error.starts_with("Semantic error: "), "{}", error);

    let config = Config {
        implicit_decls: true,
        ..Config::default()
    };

    let asm = compile(text, &config).unwrap();
    assert!(asm.contains("\tcall    undeclared\n"), "{}", asm);
}

#[test]
fn register_exhaustion_is_reported() {
    let text = "int main() {
                    int a; int b; int c; int d; int e; int f; int g; int h;
                    a = b = c = d = e = f = g = h = 1;
                    return a + (b + (c + (d + (e + (f + (g + h))))));
                }";

    let error = compile(text, &config(Backend::Ir)).unwrap_err();
    assert!(error.starts_with("Code generation error: Register exhaustion"), "{}", error);

    // El emisor de pila no tiene ese límite
    assert!(compile(text, &config(Backend::Stack)).is_ok());
}

#[test]
fn dumps_do_not_change_assembly() {
    let text = "#define TWICE(x) ((x) + (x))\nint main() { return TWICE(21); }";

    for backend in BACKENDS {
        let plain = compile(text, &config(backend)).unwrap();

        let dumped = Config {
            backend,
            dump: DumpFlags::all(),
            ..Config::default()
        };

        assert_eq!(compile(text, &dumped).unwrap(), plain);
    }
}

#[test]
fn includes_resolve_against_include_dir() {
    let dir = std::env::temp_dir().join(format!("ccx-include-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("answer.h"), "#define ANSWER 42\n").unwrap();

    let config = Config {
        include_dir: dir.clone(),
        ..Config::default()
    };

    let asm = compile("#include \"answer.h\"\nint main() { return ANSWER; }", &config);
    std::fs::remove_dir_all(&dir).unwrap();

    assert!(asm.unwrap().contains("42"));

    let error = compile("#include \"missing.h\"\n", &config).unwrap_err();
    assert!(error.starts_with("Preprocessor error: "), "{}", error);
}
