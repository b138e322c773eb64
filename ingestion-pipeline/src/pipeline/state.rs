use state_machines::state_machine;

state_machine! {
    name: IndexRunMachine,
    state: IndexRunState,
    initial: Ready,
    states: [Ready, Loaded, Indexed, Completed, Failed],
    events {
        load { transition: { from: Ready, to: Loaded } }
        index { transition: { from: Loaded, to: Indexed } }
        complete { transition: { from: Indexed, to: Completed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Loaded, to: Failed }
            transition: { from: Indexed, to: Failed }
            transition: { from: Completed, to: Failed }
        }
    }
}

pub fn ready() -> IndexRunMachine<(), Ready> {
    IndexRunMachine::new(())
}
