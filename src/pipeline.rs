//! The promotion pipeline as data: Source, Build, Dev, Test and Prod, with
//! manual approval gates in front of Test and Prod.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{AccountId, AccountSet, RepositoryCoordinate};
use crate::error::{TopologyError, ValidationError};
use crate::parameters::ParameterKind;

/// Default bootstrap qualifier; the deploy roles CDK creates carry it.
pub const CDK_QUALIFIER: &str = "hnb659fds";

pub const SYNTH_COMMANDS: [&str; 3] = ["npm ci", "npm run build", "npx cdk synth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Source,
    Build,
    Approval,
    Deploy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub name: String,
    pub category: ActionCategory,
    pub provider: String,
    pub run_order: u32,
    pub configuration: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StageKind {
    Source,
    Build,
    Dev,
    Test,
    Prod,
}

impl StageKind {
    pub const ORDER: [StageKind; 5] = [
        StageKind::Source,
        StageKind::Build,
        StageKind::Dev,
        StageKind::Test,
        StageKind::Prod,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Source => "Source",
            StageKind::Build => "Build",
            StageKind::Dev => "Dev",
            StageKind::Test => "Test",
            StageKind::Prod => "Prod",
        }
    }

    pub fn requires_approval(self) -> bool {
        matches!(self, StageKind::Test | StageKind::Prod)
    }

    fn target(self, accounts: &AccountSet) -> Option<&AccountId> {
        match self {
            StageKind::Source | StageKind::Build => None,
            StageKind::Dev => Some(&accounts.dev),
            StageKind::Test => Some(&accounts.test),
            StageKind::Prod => Some(&accounts.prod),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStage {
    pub name: String,
    pub kind: StageKind,
    pub target_account_id: Option<AccountId>,
    pub requires_approval: bool,
    pub actions: Vec<Action>,
}

impl PipelineStage {
    pub fn actions_of(&self, category: ActionCategory) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(move |a| a.category == category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    pub name: String,
    pub account_id: AccountId,
    pub region: String,
    pub stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn arn(&self) -> String {
        format!(
            "arn:aws:codepipeline:{}:{}:{}",
            self.region, self.account_id, self.name
        )
    }

    pub fn stage(&self, kind: StageKind) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Checks the structural rules every pipeline must satisfy.
    pub fn verify(&self) -> Result<(), TopologyError> {
        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind).collect();
        if kinds != StageKind::ORDER {
            let found: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
            return Err(TopologyError::StageOrder(format!(
                "expected Source, Build, Dev, Test, Prod but found {}",
                found.join(", ")
            )));
        }

        for stage in &self.stages {
            verify_stage(stage)?;
        }

        return Ok(());
    }
}

fn verify_stage(stage: &PipelineStage) -> Result<(), TopologyError> {
    let violation = |message: &str| TopologyError::StageOrder(format!("{}: {}", stage.name, message));

    let approvals: Vec<(usize, &Action)> = stage
        .actions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.category == ActionCategory::Approval)
        .collect();
    let deploys: Vec<(usize, &Action)> = stage
        .actions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.category == ActionCategory::Deploy)
        .collect();

    match stage.kind {
        StageKind::Source => {
            if stage.actions.len() != 1 || stage.actions[0].category != ActionCategory::Source {
                return Err(violation("must hold exactly one source action"));
            }
        }
        StageKind::Build => {
            if stage.actions_of(ActionCategory::Build).count() == 0 {
                return Err(violation("has no build action"));
            }
        }
        kind => {
            if deploys.len() != 1 {
                return Err(violation("must hold exactly one deploy action"));
            }
            let (deploy_index, deploy) = deploys[0];
            let target = stage.target_account_id.as_ref().map(AccountId::as_str);
            if deploy.configuration.get("Account").map(String::as_str) != target {
                return Err(violation("deploy action does not target the stage account"));
            }

            if kind.requires_approval() != stage.requires_approval {
                return Err(violation("approval flag does not match the stage"));
            }
            if !stage.requires_approval {
                if !approvals.is_empty() {
                    return Err(violation("ungated stage holds an approval"));
                }
                return Ok(());
            }

            if approvals.len() != 1 {
                return Err(violation("must hold exactly one approval action"));
            }
            let (approval_index, approval) = approvals[0];
            if approval_index > deploy_index || approval.run_order >= deploy.run_order {
                return Err(violation("approval must run before deployment"));
            }
        }
    }

    return Ok(());
}

/// Builds the stage sequence for one repository and account set.
pub struct PipelineBuilder<'a> {
    accounts: &'a AccountSet,
    repository: &'a RepositoryCoordinate,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(accounts: &'a AccountSet, repository: &'a RepositoryCoordinate) -> Self {
        Self {
            accounts,
            repository,
        }
    }

    pub fn pipeline_name(repository: &RepositoryCoordinate) -> String {
        format!("{}-pipeline", repository.name)
    }

    pub fn build(&self) -> Result<Pipeline, ValidationError> {
        let fields = [
            ("owner", &self.repository.owner),
            ("name", &self.repository.name),
            ("branch", &self.repository.branch),
        ];
        for (label, value) in fields {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyRepositoryField(label));
            }
        }

        let stages = StageKind::ORDER
            .into_iter()
            .map(|kind| self.stage(kind))
            .collect();

        return Ok(Pipeline {
            name: Self::pipeline_name(self.repository),
            account_id: self.accounts.pipeline.clone(),
            region: self.accounts.region.clone(),
            stages,
        });
    }

    fn stage(&self, kind: StageKind) -> PipelineStage {
        let target = kind.target(self.accounts).cloned();
        let actions = match (kind, &target) {
            (StageKind::Source, _) => vec![self.source_action()],
            (StageKind::Build, _) => vec![self.synth_action()],
            (_, Some(account)) if kind.requires_approval() => {
                vec![self.approval_action(kind, account), self.deploy_action(kind, account, 2)]
            }
            (_, Some(account)) => vec![self.deploy_action(kind, account, 1)],
            (_, None) => Vec::new(),
        };

        PipelineStage {
            name: kind.name().to_string(),
            kind,
            target_account_id: target,
            requires_approval: kind.requires_approval(),
            actions,
        }
    }

    fn source_action(&self) -> Action {
        let mut configuration = BTreeMap::new();
        configuration.insert(String::from("Owner"), self.repository.owner.clone());
        configuration.insert(String::from("Repo"), self.repository.name.clone());
        configuration.insert(String::from("Branch"), self.repository.branch.clone());
        // A dynamic reference; the token itself never enters the graph.
        configuration.insert(
            String::from("OAuthToken"),
            format!(
                "{{{{resolve:{}:/cdk/github/token}}}}",
                ssm_reference(ParameterKind::Secret)
            ),
        );
        configuration.insert(String::from("PollForSourceChanges"), String::from("false"));

        Action {
            name: String::from("GitHub"),
            category: ActionCategory::Source,
            provider: String::from("GitHub"),
            run_order: 1,
            configuration,
        }
    }

    fn synth_action(&self) -> Action {
        let mut configuration = BTreeMap::new();
        configuration.insert(
            String::from("ProjectName"),
            format!("{}-synth", self.repository.name),
        );
        configuration.insert(String::from("Commands"), SYNTH_COMMANDS.join(" && "));

        Action {
            name: String::from("Synth"),
            category: ActionCategory::Build,
            provider: String::from("CodeBuild"),
            run_order: 1,
            configuration,
        }
    }

    fn approval_action(&self, kind: StageKind, account: &AccountId) -> Action {
        let mut configuration = BTreeMap::new();
        configuration.insert(
            String::from("CustomData"),
            format!(
                "Approve deployment of {} to {} ({})",
                self.repository.full_name(),
                kind,
                account
            ),
        );

        Action {
            name: format!("Approve{}", kind),
            category: ActionCategory::Approval,
            provider: String::from("Manual"),
            run_order: 1,
            configuration,
        }
    }

    fn deploy_action(&self, kind: StageKind, account: &AccountId, run_order: u32) -> Action {
        let region = &self.accounts.region;
        let stack_name = format!("{}-{}", self.repository.name, kind.name().to_lowercase());

        let mut configuration = BTreeMap::new();
        configuration.insert(String::from("ActionMode"), String::from("CREATE_UPDATE"));
        configuration.insert(String::from("Account"), account.to_string());
        configuration.insert(String::from("Region"), region.clone());
        configuration.insert(String::from("StackName"), stack_name.clone());
        configuration.insert(
            String::from("TemplatePath"),
            format!("SynthOutput::{}.template.json", stack_name),
        );
        configuration.insert(
            String::from("RoleArn"),
            format!(
                "arn:aws:iam::{}:role/cdk-{}-deploy-role-{}-{}",
                account, CDK_QUALIFIER, account, region
            ),
        );

        Action {
            name: format!("Deploy{}", kind),
            category: ActionCategory::Deploy,
            provider: String::from("CloudFormation"),
            run_order,
            configuration,
        }
    }
}

fn ssm_reference(kind: ParameterKind) -> &'static str {
    match kind {
        ParameterKind::Plain => "ssm",
        ParameterKind::Secret => "ssm-secure",
    }
}
