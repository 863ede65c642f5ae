use clap::{Parser, Subcommand};
use color_eyre::eyre::bail;
use color_eyre::Result;
use std::path::PathBuf;

use projdash::api::{BulkUpdate, PageParams, Project, ProjectChanges, ProjectFilters, ProjectPage};
use projdash::config::Config;
use projdash::logging;
use projdash::query::{Query, QueryState};
use projdash::session::Session;

#[derive(Parser, Debug)]
#[command(name = "projdash")]
#[command(about = "A headless client for the projects dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/projdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the project list whenever it changes, until Ctrl-C
  Watch(WatchArgs),
  /// Show one project
  Show { id: u64 },
  /// Soft-delete a project
  Delete { id: u64 },
  /// Restore soft-deleted projects
  Recover {
    #[arg(required = true)]
    ids: Vec<u64>,
  },
  /// Change fields of one project
  Update {
    id: u64,
    #[command(flatten)]
    fields: FieldArgs,
    /// Version the change is based on; rejected if the project moved on
    #[arg(long)]
    version: Option<u64>,
  },
  /// Change status, owner or health of several projects, optionally adding a tag
  BulkUpdate {
    #[arg(required = true)]
    ids: Vec<u64>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    health: Option<String>,
    #[arg(long)]
    tag: Option<String>,
  },
  /// Create a project
  Create {
    #[command(flatten)]
    fields: FieldArgs,
  },
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
  #[arg(long)]
  search: Option<String>,
  #[arg(long)]
  status: Option<String>,
  #[arg(long)]
  owner: Option<String>,
  #[arg(long)]
  health: Option<String>,
  /// Matches projects whose tags contain this text
  #[arg(long)]
  tag: Option<String>,
  /// Sort field, prefix with '-' for descending
  #[arg(long)]
  ordering: Option<String>,
  #[arg(long, default_value_t = 9)]
  limit: u64,
  #[arg(long, default_value_t = 0)]
  offset: u64,
  /// Watch soft-deleted projects instead
  #[arg(long)]
  deleted: bool,
}

#[derive(clap::Args, Debug)]
struct FieldArgs {
  #[arg(long)]
  title: Option<String>,
  #[arg(long)]
  description: Option<String>,
  #[arg(long)]
  owner: Option<String>,
  #[arg(long)]
  progress: Option<f64>,
  #[arg(long)]
  status: Option<String>,
  #[arg(long)]
  health: Option<String>,
  /// Replaces the tag list
  #[arg(long, value_delimiter = ',')]
  tags: Option<Vec<String>>,
}

impl From<FieldArgs> for ProjectChanges {
  fn from(args: FieldArgs) -> Self {
    ProjectChanges {
      title: args.title,
      description: args.description,
      owner: args.owner,
      progress: args.progress,
      tags: args.tags,
      health: args.health,
      status: args.status,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let mut session = Session::connect(&config)?;
  let result = run(&mut session, args.command).await;
  session.shutdown().await;
  result
}

async fn run(session: &mut Session, command: Command) -> Result<()> {
  let api = session.api().clone();
  match command {
    Command::Watch(args) => watch(session, args).await?,
    Command::Show { id } => {
      let mut query = api.project(id);
      match query.ready().await {
        QueryState::Success(project) => print_project(project),
        QueryState::Error { error, .. } => return Err(error.clone().into()),
        _ => {}
      }
    }
    Command::Delete { id } => {
      api.delete_project(id).await?;
      println!("deleted {id}");
    }
    Command::Recover { ids } => {
      if let [id] = ids.as_slice() {
        print_project(&api.recover_project(*id).await?);
      } else {
        let result = api.bulk_recover(&ids).await?;
        println!("recovered {} of {:?}", result.updated_count, result.requested_ids);
      }
    }
    Command::Update {
      id,
      fields,
      version,
    } => {
      let changes = ProjectChanges::from(fields);
      if changes.is_empty() {
        bail!("nothing to update, pass at least one field");
      }
      let project = api.update_project(id, &changes, version).await?;
      print_project(&project);
    }
    Command::BulkUpdate {
      ids,
      status,
      owner,
      health,
      tag,
    } => {
      let update = BulkUpdate {
        ids,
        status,
        owner,
        health,
        tag,
      };
      let result = api.bulk_update(&update).await?;
      println!(
        "updated {} (found {:?} of {:?})",
        result.updated_count, result.found_ids, result.requested_ids
      );
    }
    Command::Create { fields } => {
      let project = api.create_project(&fields.into()).await?;
      print_project(&project);
    }
  }
  Ok(())
}

async fn watch(session: &mut Session, args: WatchArgs) -> Result<()> {
  session.start_stream();
  let mut query: Query<ProjectPage> = if args.deleted {
    session.api().deleted_projects(PageParams {
      limit: Some(args.limit),
      offset: Some(args.offset),
    })
  } else {
    session.api().projects(&ProjectFilters {
      limit: Some(args.limit),
      offset: Some(args.offset),
      search: args.search,
      status: args.status,
      owner: args.owner,
      tags: args.tag,
      health: args.health,
      ordering: args.ordering,
    })
  };

  print_page(query.ready().await);
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = query.changed() => {
        if !changed {
          break;
        }
        // Background refreshes keep showing the previous page.
        if !query.is_fetching() {
          print_page(query.state());
        }
      }
    }
  }
  Ok(())
}

fn print_page(state: &QueryState<ProjectPage>) {
  match state {
    QueryState::Idle => {}
    QueryState::Loading => println!("loading..."),
    QueryState::Success(page) => {
      println!("{} projects", page.count);
      for project in &page.results {
        print_row(project);
      }
      println!();
    }
    QueryState::Error { error, data } => {
      println!("error: {error}");
      if let Some(page) = data {
        for project in &page.results {
          print_row(project);
        }
      }
    }
  }
}

fn print_row(project: &Project) {
  println!(
    "{:>6}  {:<10} {:<10} {:>5.1}%  {} ({})",
    project.id, project.status, project.health, project.progress, project.title, project.owner
  );
}

fn print_project(project: &Project) {
  println!("#{} {}", project.id, project.title);
  println!("  owner:    {}", project.owner);
  println!("  status:   {}", project.status);
  println!("  health:   {}", project.health);
  println!("  progress: {:.1}%", project.progress);
  if !project.tags.is_empty() {
    println!("  tags:     {}", project.tags.join(", "));
  }
  if let Some(updated) = project.last_updated {
    println!("  updated:  {}", updated.format("%Y-%m-%d %H:%M"));
  }
  println!("  version:  {}", project.version);
  if !project.description.is_empty() {
    println!();
    println!("{}", project.description);
  }
}
