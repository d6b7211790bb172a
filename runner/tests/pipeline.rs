use kpath_runner::{
    combiner::CombineError,
    config::PipelineConfig,
    executors::{JobHandle, QueryStatus, Scheduler, SchedulerError},
    manifest::PathManifest,
    orchestrator::OrchestratorError,
    pipeline::{Pipeline, PipelineError},
    sync::CancellationToken,
    template::TemplateError,
};
use std::{
    cell::RefCell,
    collections::BTreeSet,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

const TEMPLATE: &str = r#"<?xml version="1.0"?>
<nemo>
  <group type="obj">
    <name>ShapeName_1</name>
    <param><cTag>mat</cTag><value>{ GaAs zincblende }</value></param>
  </group>
  <group type="solver">
    <param><cTag>k0</cTag><value>{ 0 0 0 }</value></param>
    <param><cTag>kf</cTag><value>{ 0 0 0 }</value></param>
  </group>
</nemo>
"#;

/// Stands in for a cluster: every submitted job "runs" instantly and leaves its table behind
struct FakeCluster {
    output: PathBuf,
    submitted: RefCell<Vec<PathBuf>>,
    // submissions (by order) that never produce a table
    lost: BTreeSet<usize>,
    failing_queries: BTreeSet<String>,
    status: QueryStatus,
}

impl FakeCluster {
    fn new(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            submitted: RefCell::new(Vec::new()),
            lost: BTreeSet::new(),
            failing_queries: BTreeSet::new(),
            status: QueryStatus::Finished,
        }
    }

    fn submissions(&self) -> usize {
        self.submitted.borrow().len()
    }
}

impl Scheduler for FakeCluster {
    fn submit(&self, script: &Path) -> Result<JobHandle, SchedulerError> {
        let stem = script.file_stem().unwrap().to_str().unwrap().to_owned();
        let number = self.submissions();
        self.submitted.borrow_mut().push(script.to_path_buf());

        if !self.lost.contains(&number) {
            fs::write(
                self.output.join(format!("{stem}.csv")),
                format!("kx,ky,kz,E\n{number},0,0,-1\n{number},1,0,-2\n"),
            )
            .unwrap();
        }

        Ok(JobHandle::new(stem))
    }

    fn query(&self, handle: &JobHandle) -> Result<QueryStatus, SchedulerError> {
        if self.failing_queries.contains(handle.as_str()) {
            return Err(SchedulerError::Query {
                handle: handle.clone(),
                reason: "qstat: cannot connect to server".to_owned(),
            });
        }

        Ok(self.status)
    }
}

struct Workspace {
    directory: TempDir,
    config: PipelineConfig,
}

impl Workspace {
    fn new(path: &str, template: &str) -> Self {
        let directory = tempfile::tempdir().unwrap();
        let template_path = directory.path().join("bulk.xml");
        fs::write(&template_path, template).unwrap();

        let mut config = PipelineConfig::default();
        config.paths.path = path.to_owned();
        config.paths.template = Some(template_path);
        config.paths.output = directory.path().join("BSNewOutput");
        config.paths.job_directory = directory.path().join("jobs");
        config.polling.interval_secs = 1;
        config.polling.timeout_secs = 5;

        Self { directory, config }
    }

    fn output(&self) -> PathBuf {
        self.directory.path().join("BSNewOutput")
    }

    fn merged(&self) -> PathBuf {
        self.output().join("GaAs_combined.csv")
    }

    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.config).with_converter(PathBuf::from("kpath"))
    }
}

#[test]
fn gamma_x_l_end_to_end() {
    let workspace = Workspace::new("G,X,L", TEMPLATE);
    // the output directory only exists once the pipeline created it
    let cluster = FakeCluster::new(&workspace.output());

    let merged = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap();

    assert_eq!(cluster.submissions(), 2);
    assert_eq!(
        *cluster.submitted.borrow(),
        vec![
            workspace.directory.path().join("jobs/bulk_0_0_0to0_2_0.sh"),
            workspace.directory.path().join("jobs/bulk_0_2_0to1_1_1.sh"),
        ]
        .into_iter()
        .map(|path| path.canonicalize().unwrap())
        .collect::<Vec<_>>()
    );

    assert_eq!(merged.path, workspace.merged().canonicalize().unwrap());
    assert_eq!(merged.rows, 4);
    assert_eq!(
        fs::read_to_string(workspace.merged()).unwrap(),
        "kx,ky,kz,E,Segment_Point\n\
         0,0,0,-1,Γ\n\
         0,1,0,-2,X\n\
         1,0,0,-1,X\n\
         1,1,0,-2,L\n"
    );

    let input = fs::read_to_string(workspace.output().join("bulk_0_2_0to1_1_1.xml")).unwrap();
    assert!(input.contains("<cTag>k0</cTag><value>{ 0 2 0 }</value>"));
    assert!(input.contains("<cTag>kf</cTag><value>{ 1 1 1 }</value>"));

    let script = workspace.directory.path().join("jobs/bulk_0_0_0to0_2_0.sh");
    assert!(fs::read_to_string(&script)
        .unwrap()
        .contains("\"kpath\" convert \"bulk_0_0_0to0_2_0.nd_Ek_ascii\""));
    assert_eq!(
        fs::metadata(&script).unwrap().permissions().mode() & 0o111,
        0o111
    );

    let manifest = PathManifest::read(&workspace.output()).unwrap();
    assert_eq!(manifest.title, "GaAs");
    assert_eq!(manifest.symbolic_path, vec!["Γ", "X", "L"]);
    assert_eq!(manifest.coordinate_representation.len(), 2);
}

#[test]
fn missing_output_is_reported_and_nothing_merged() {
    let workspace = Workspace::new("G,X,L", TEMPLATE);
    let mut cluster = FakeCluster::new(&workspace.output());
    cluster.lost.insert(1);

    let error = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap_err();

    assert_eq!(error.stage(), "combine");
    assert_eq!(error.segment(), Some(1));
    assert!(matches!(
        error,
        PipelineError::Combine(CombineError::MissingSegmentOutput { index: 1, .. })
    ));
    assert!(!workspace.merged().exists());
}

#[test]
fn failing_query_still_releases_barrier() {
    let workspace = Workspace::new("G,X,L", TEMPLATE);
    let mut cluster = FakeCluster::new(&workspace.output());
    cluster
        .failing_queries
        .insert("bulk_0_0_0to0_2_0".to_owned());

    let merged = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap();

    assert_eq!(merged.rows, 4);
}

#[test]
fn unknown_waypoint_shortens_path() {
    let workspace = Workspace::new("G, Q ,X", TEMPLATE);
    let cluster = FakeCluster::new(&workspace.output());

    let merged = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap();

    assert_eq!(cluster.submissions(), 1);
    assert_eq!(merged.boundaries, vec![(0, "Γ".to_owned()), (1, "X".to_owned())]);
}

#[test]
fn revisited_pair_shares_its_job() {
    let workspace = Workspace::new("G,X,G,X", TEMPLATE);
    let cluster = FakeCluster::new(&workspace.output());

    let merged = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap();

    assert_eq!(cluster.submissions(), 2);
    // the first and the last segment read the same table
    assert_eq!(merged.rows, 6);
    assert_eq!(
        fs::read_to_string(workspace.merged())
            .unwrap()
            .lines()
            .last()
            .unwrap(),
        "0,1,0,-2,X"
    );
}

#[test]
fn malformed_template_submits_nothing() {
    let workspace = Workspace::new(
        "G,X,L",
        &TEMPLATE.replace("<cTag>kf</cTag>", "<cTag>nk</cTag>"),
    );
    let cluster = FakeCluster::new(&workspace.output());

    let error = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Materialize(TemplateError::TemplateMalformed(ref tag)) if tag == "kf"
    ));
    assert_eq!(cluster.submissions(), 0);
}

#[test]
fn stuck_jobs_time_out() {
    let mut workspace = Workspace::new("G,X,L", TEMPLATE);
    workspace.config.polling.timeout_secs = 0;
    let mut cluster = FakeCluster::new(&workspace.output());
    cluster.status = QueryStatus::Running;

    let error = workspace
        .pipeline()
        .run(&cluster, CancellationToken::new())
        .unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Orchestrate(OrchestratorError::OrchestrationTimeout { ref pending, .. })
            if pending == &vec![0, 1]
    ));
    assert!(!workspace.merged().exists());
}

#[test]
fn prepare_then_combine() {
    let workspace = Workspace::new("L,G,X", TEMPLATE);

    let prepared = workspace.pipeline().prepare().unwrap();
    assert_eq!(prepared.scripts.len(), 2);
    assert!(prepared.scripts.iter().all(|script| script.is_file()));

    for (number, segment) in prepared.materialized.iter().enumerate() {
        fs::write(
            &segment.expected_output,
            format!("kx,ky,kz,E\n{number},0,0,0.5\n"),
        )
        .unwrap();
    }

    let merged = workspace.pipeline().combine_existing().unwrap();

    assert_eq!(merged.rows, 2);
    // single row segments carry their end point
    assert_eq!(
        fs::read_to_string(workspace.merged()).unwrap(),
        "kx,ky,kz,E,Segment_Point\n0,0,0,0.5,Γ\n1,0,0,0.5,X\n"
    );
}

#[test]
fn interrupt_before_submission_submits_nothing() {
    let workspace = Workspace::new("G,X,L", TEMPLATE);
    let cluster = FakeCluster::new(&workspace.output());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = workspace.pipeline().run(&cluster, cancel).unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Orchestrate(OrchestratorError::Cancelled { ref pending })
            if pending == &vec![0, 1]
    ));
    assert_eq!(cluster.submissions(), 0);
    assert!(!workspace.merged().exists());
}
