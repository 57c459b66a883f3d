use berth_schema::{
    render_manifest, ContainerTemplate, ExtraContext, InstanceContext, LimitValue, RenderOptions,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::Value;

fn sample() -> (ContainerTemplate, InstanceContext) {
    let mut template = ContainerTemplate {
        image: Some("eclipse-temurin:{java_version}-jre".into()),
        ports: vec!["{port}:25565/tcp".into(), "{rcon_port}:25575/tcp".into()],
        volumes: vec!["./server:/data".into()],
        working_dir: Some("/data".into()),
        entrypoint: Some("/bin/sh -c".into()),
        command: Some("exec java -Xmx{memory} -jar server.jar nogui".into()),
        cpu_limit: Some(LimitValue::Integer(2)),
        memory_limit: Some(LimitValue::Text("{memory}".into())),
        ..ContainerTemplate::default()
    };
    for i in 0..16 {
        template
            .environment
            .insert(format!("SETTING_{i}"), Value::from(format!("{{setting_{i}}}")));
    }
    let mut ctx = InstanceContext {
        instance_id: "0123abcd-5555-6666-7777-888899990000".into(),
        instance_name: "bench".into(),
        module_name: "minecraft".into(),
        port: Some(25565),
        rcon_port: Some(25575),
        ..InstanceContext::default()
    };
    ctx.module_settings.insert("memory".into(), Value::from("4G"));
    for i in 0..16 {
        ctx.module_settings
            .insert(format!("setting_{i}"), Value::from(i));
    }
    (template, ctx)
}

fn bench_render(c: &mut Criterion) {
    let (template, ctx) = sample();
    let extra = ExtraContext::with_java_version("21");
    c.bench_function("render_manifest_16_settings", |b| {
        b.iter(|| {
            render_manifest(&template, &ctx, &extra, RenderOptions::default()).unwrap();
        });
    });
}

fn bench_render_host_network(c: &mut Criterion) {
    let (template, ctx) = sample();
    let extra = ExtraContext::with_java_version("21");
    let options = RenderOptions {
        force_host_network: true,
    };
    c.bench_function("render_manifest_host_network", |b| {
        b.iter(|| {
            render_manifest(&template, &ctx, &extra, options).unwrap();
        });
    });
}

criterion_group!(benches, bench_render, bench_render_host_network);
criterion_main!(benches);
