//! Rendering of the batch script template.
//!
//! The code's script text is a template with three named bindings, each a
//! snapshot of the stored row: `{{calc.*}}`, `{{code.*}}` and
//! `{{client.*}}`. Unknown placeholders are errors, so a bad template
//! surfaces at submit time instead of silently rendering empty.

use minijinja::{context, Environment, UndefinedBehavior};
use restflow_store::{CalcJob, Client, Code};

pub fn render_script(
    calc: &CalcJob,
    code: &Code,
    client: &Client,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("script", &code.script)?;
    env.get_template("script")?
        .render(context! { calc => calc, code => code, client => client })
}

#[cfg(test)]
mod tests {
    use super::*;
    use restflow_store::FileSystem;

    fn fixtures() -> (CalcJob, Code, Client) {
        let client = Client {
            pk: Some(1),
            label: "cluster".into(),
            client_url: "http://localhost:8000".into(),
            client_id: "sample".into(),
            client_secret: "secret".into(),
            token_uri: "http://localhost:8080/token".into(),
            machine_name: "daint".into(),
            work_dir: "/scratch/user".into(),
            fsystem: FileSystem::Posix,
            small_file_size_mb: 5,
        };
        let code = Code {
            pk: Some(2),
            label: "echo".into(),
            client_pk: 1,
            script: String::new(),
            upload_paths: Default::default(),
        };
        let calc = CalcJob {
            pk: Some(3),
            label: "run".into(),
            uuid: "123e4567-e89b-12d3-a456-426614174000".into(),
            code_pk: 2,
            parameters: serde_json::json!({"n": 3})
                .as_object()
                .cloned()
                .unwrap(),
            upload_paths: Default::default(),
            download_globs: vec![],
        };
        (calc, code, client)
    }

    #[test]
    fn bindings_resolve_against_all_three_rows() {
        let (calc, mut code, client) = fixtures();
        code.script = "#!/bin/bash\n#SBATCH --job-name={{calc.uuid}}\n\
                       # code {{code.label}} on {{client.machine_name}}\n\
                       echo {{calc.parameters.n}}\n"
            .into();
        let rendered = render_script(&calc, &code, &client).unwrap();
        assert!(rendered.contains("--job-name=123e4567-e89b-12d3-a456-426614174000"));
        assert!(rendered.contains("# code echo on daint"));
        assert!(rendered.contains("echo 3"));
    }

    #[test]
    fn plain_scripts_pass_through() {
        let (calc, mut code, client) = fixtures();
        code.script = "echo hi > out.txt\n".into();
        assert_eq!(render_script(&calc, &code, &client).unwrap(), "echo hi > out.txt\n");
    }

    #[test]
    fn unknown_placeholders_error() {
        let (calc, mut code, client) = fixtures();
        code.script = "echo {{mystery.value}}".into();
        assert!(render_script(&calc, &code, &client).is_err());
    }
}
